use reqwest::Client;
use threshold_alerts_lib::config::AlertsConfig;
use threshold_alerts_lib::db::initialize_pool;
use threshold_alerts_lib::error::AppError;
use threshold_alerts_lib::init_tracing;
use threshold_alerts_lib::session::server::run_session_server;
use threshold_alerts_lib::session::symbols::resolve_supported_symbols;
use threshold_alerts_lib::state::SessionServerState;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_tracing();

    let config = AlertsConfig::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        database_url = %config.database_url,
        client_receive_timeout_ms = config.client_receive_timeout.as_millis() as u64,
        "session server configuration loaded"
    );

    let db_pool = match initialize_pool(&config).await {
        Ok(pool) => pool,
        Err(error) => {
            error!(%error, "failed to open alert store");
            return Err(error);
        }
    };

    let supported_symbols = resolve_supported_symbols(&config, &Client::new()).await;
    let state = SessionServerState::new(db_pool.clone(), config, supported_symbols);
    let started_at = state.started_at;

    let cancel_token = CancellationToken::new();
    let signal_token = cancel_token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                signal_token.cancel();
            }
            Err(error) => warn!(%error, "failed to listen for shutdown signal"),
        }
    });

    let result = run_session_server(state, cancel_token).await;
    db_pool.close().await;
    info!(uptime_secs = started_at.elapsed().as_secs(), "session server stopped");
    result
}
