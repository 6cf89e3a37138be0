use crate::config::AlertsConfig;
use crate::error::AppError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn is_in_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Opens the shared store and brings its schema up to date.
///
/// Both processes point at the same database file, so file-backed stores use WAL and a busy
/// timeout to let the ingester and the session server commit concurrently. An in-memory
/// store only exists per connection and is therefore pinned to a single pooled connection.
pub async fn initialize_pool_from_url(
    database_url: &str,
    pool_size: u32,
) -> Result<SqlitePool, AppError> {
    let in_memory = is_in_memory_url(database_url);
    let mut connect_options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);
    if !in_memory {
        connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(pool_size)
    };

    let pool = pool_options.connect_with(connect_options).await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

pub async fn initialize_pool(config: &AlertsConfig) -> Result<SqlitePool, AppError> {
    initialize_pool_from_url(&config.database_url, config.pool_size).await
}

pub async fn initialize_memory_pool() -> Result<SqlitePool, AppError> {
    initialize_pool_from_url("sqlite::memory:", 1).await
}
