use sea_orm::DatabaseConnection;

use crate::config::Config;
use crate::sessions::{Broker, SessionRegistry};

/// Shared application state available to all request handlers via Axum's `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Config,
    pub broker: Broker,
    /// Present only when the change-feed relay is in use.
    pub db: Option<DatabaseConnection>,
}

impl AppState {
    #[must_use]
    pub const fn new(config: Config, broker: Broker, db: Option<DatabaseConnection>) -> Self {
        Self { config, broker, db }
    }

    #[must_use]
    pub const fn registry(&self) -> &SessionRegistry {
        self.broker.registry()
    }
}
