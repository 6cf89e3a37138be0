use threshold_alerts_lib::config::AlertsConfig;
use threshold_alerts_lib::db::initialize_pool;
use threshold_alerts_lib::error::AppError;
use threshold_alerts_lib::init_tracing;
use threshold_alerts_lib::state::IngestionHandle;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_tracing();

    let config = AlertsConfig::from_env()?;
    info!(
        feed_url = %config.feed_url,
        database_url = %config.database_url,
        reconcile_period_ms = config.reconcile_period.as_millis() as u64,
        heartbeat_limit_ms = config.heartbeat_limit_ms(),
        "ingestion configuration loaded"
    );

    let db_pool = match initialize_pool(&config).await {
        Ok(pool) => pool,
        Err(error) => {
            error!(%error, "failed to open alert store");
            return Err(error);
        }
    };

    let ingestion = IngestionHandle::spawn(db_pool.clone(), config);
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    ingestion.stop().await;
    db_pool.close().await;
    Ok(())
}
