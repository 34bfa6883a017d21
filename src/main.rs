use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::{Method, Request, header};
use axum::response::Response;
use sea_orm::DatabaseConnection;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::Span;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use classroom_live::config::{Config, Environment};
use classroom_live::relay::change_feed::SessionStore;
use classroom_live::relay::{ChangeFeedRelay, PushRelay, Relay, RelayKind};
use classroom_live::sessions::{Broker, Session, SessionRegistry};
use classroom_live::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize structured logging
    init_tracing(&config.log_level);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = ?config.environment,
        relay = %config.relay_mode,
        "Starting classroom-live"
    );

    // Build the relay (and, for the change feed, the database behind it)
    let (relay, db, recovered) = build_relay(&config).await?;

    // Start the registry with its idle-session sweep
    let registry = SessionRegistry::init(relay, config.registry_settings());
    registry.restore(recovered);

    let state = AppState::new(config.clone(), Broker::new(registry.clone()), db);
    let app = build_app(state, &config);

    // Start the server
    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.shutdown().await;
    Ok(())
}

/// Build the configured relay, returning any database handle and recovered sessions.
async fn build_relay(
    config: &Config,
) -> anyhow::Result<(Arc<dyn Relay>, Option<DatabaseConnection>, Vec<Session>)> {
    match config.relay_mode {
        RelayKind::Push => Ok((Arc::new(PushRelay::new()), None, Vec::new())),
        RelayKind::ChangeFeed => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?;
            let db = classroom_live::db::connect_and_migrate(url).await?;
            let (relay, recovered) = ChangeFeedRelay::start(SessionStore::new(db.clone())).await?;
            Ok((Arc::new(relay), Some(db), recovered))
        }
    }
}

/// Build the full application router with all middleware layers.
fn build_app(state: AppState, config: &Config) -> Router {
    let cors = if config.environment == Environment::Production {
        let origin = config
            .frontend_url
            .parse::<axum::http::HeaderValue>()
            .unwrap_or_else(|_| axum::http::HeaderValue::from_static("http://localhost:3001"));

        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
            .allow_credentials(true)
            .max_age(Duration::from_secs(3600))
    } else {
        CorsLayer::permissive()
    };

    let trace = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
                status_code = tracing::field::Empty,
            )
        })
        .on_response(|response: &Response, latency: Duration, span: &Span| {
            span.record("status_code", response.status().as_u16());
            tracing::info!(latency_ms = latency.as_millis(), "response");
        });

    classroom_live::routes::router()
        .with_state(state)
        .layer(cors)
        .layer(trace)
}

/// Initialize the `tracing` subscriber with an environment-based filter.
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("classroom_live={log_level},tower_http=info,sea_orm=warn").into()
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            tracing::info!("Received terminate signal, shutting down gracefully...");
        },
    }
}
