use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::relay::RelayKind;
use crate::sessions::RegistrySettings;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Required when `relay_mode` is `change_feed`.
    pub database_url: Option<String>,
    pub server_host: IpAddr,
    pub server_port: u16,
    pub environment: Environment,
    pub log_level: String,
    pub relay_mode: RelayKind,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    pub frontend_url: String,
}

/// Deployment environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional with defaults: `SERVER_HOST`, `SERVER_PORT`, `ENVIRONMENT`, `LOG_LEVEL`,
    /// `RELAY_MODE`, `SESSION_TTL_SECS`, `SESSION_SWEEP_INTERVAL_SECS`, `FRONTEND_URL`.
    /// `DATABASE_URL` is required for the change-feed relay.
    ///
    /// `PORT` overrides `SERVER_PORT`, and the host defaults to `0.0.0.0` in production.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable holds an invalid value, or if `RELAY_MODE` is
    /// `change_feed` without a `DATABASE_URL`.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let environment = match std::env::var("ENVIRONMENT")
            .unwrap_or_else(|_| "development".to_string())
            .as_str()
        {
            "production" => Environment::Production,
            "staging" => Environment::Staging,
            _ => Environment::Development,
        };

        let server_port = std::env::var("PORT")
            .or_else(|_| std::env::var("SERVER_PORT"))
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| anyhow::anyhow!("SERVER_PORT / PORT must be a valid u16"))?;

        // In production, default to 0.0.0.0 so the platform router can reach us
        let default_host = if environment == Environment::Production {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        };

        let server_host = std::env::var("SERVER_HOST")
            .unwrap_or_else(|_| default_host.to_string())
            .parse::<IpAddr>()
            .map_err(|_| anyhow::anyhow!("SERVER_HOST must be a valid IP address"))?;

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let relay_mode = std::env::var("RELAY_MODE")
            .unwrap_or_else(|_| "push".to_string())
            .parse::<RelayKind>()?;

        let database_url = std::env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());
        if relay_mode == RelayKind::ChangeFeed && database_url.is_none() {
            anyhow::bail!("DATABASE_URL must be set when RELAY_MODE is change_feed");
        }

        let session_ttl = Duration::from_secs(secs_var("SESSION_TTL_SECS", 3600)?);
        let sweep_interval = Duration::from_secs(secs_var("SESSION_SWEEP_INTERVAL_SECS", 60)?);

        let frontend_url =
            std::env::var("FRONTEND_URL").unwrap_or_else(|_| "http://localhost:3001".to_string());

        Ok(Self {
            database_url,
            server_host,
            server_port,
            environment,
            log_level,
            relay_mode,
            session_ttl,
            sweep_interval,
            frontend_url,
        })
    }

    /// Build the socket address for the server to bind to.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server_host, self.server_port)
    }

    /// Registry tuning derived from this configuration.
    #[must_use]
    pub const fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            session_ttl: self.session_ttl,
            sweep_interval: self.sweep_interval,
        }
    }
}

/// Read a positive number of seconds from `name`, falling back to `default`.
fn secs_var(name: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(secs),
            _ => Err(anyhow::anyhow!("{name} must be a positive number of seconds")),
        },
        Err(_) => Ok(default),
    }
}
