use std::time::Duration;

use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};

/// Open a pooled connection to the session store.
///
/// `SQLite` gets a single connection: every connection to `sqlite::memory:` would otherwise
/// see its own empty database.
///
/// # Errors
///
/// Returns an error if the connection cannot be established.
pub async fn connect(database_url: &str) -> anyhow::Result<DatabaseConnection> {
    let max_connections = if database_url.starts_with("sqlite:") { 1 } else { 10 };

    let mut opts = ConnectOptions::new(database_url);
    opts.max_connections(max_connections)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(5))
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(false);

    let db = Database::connect(opts).await?;
    Ok(db)
}

/// Connect and bring the `live_session` schema up to date.
///
/// # Errors
///
/// Returns an error if the connection or a migration fails.
pub async fn connect_and_migrate(database_url: &str) -> anyhow::Result<DatabaseConnection> {
    tracing::info!("Connecting to database...");
    let db = connect(database_url).await?;
    tracing::info!("Database connected");

    tracing::info!("Running database migrations...");
    Migrator::up(&db, None).await?;
    tracing::info!("Migrations applied");

    Ok(db)
}
