use crate::alerts::pipeline::run_ingestion;
use crate::config::AlertsConfig;
use crate::session::symbols::SupportedSymbols;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shared by every session task of the session server.
#[derive(Debug, Clone)]
pub struct SessionServerState {
    pub started_at: Instant,
    pub db_pool: SqlitePool,
    pub config: AlertsConfig,
    pub supported_symbols: Arc<SupportedSymbols>,
}

impl SessionServerState {
    pub fn new(
        db_pool: SqlitePool,
        config: AlertsConfig,
        supported_symbols: SupportedSymbols,
    ) -> Self {
        Self {
            started_at: Instant::now(),
            db_pool,
            config,
            supported_symbols: Arc::new(supported_symbols),
        }
    }
}

pub struct IngestionHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

impl IngestionHandle {
    pub fn spawn(db_pool: SqlitePool, config: AlertsConfig) -> Self {
        let cancellation_token = CancellationToken::new();
        let task_token = cancellation_token.clone();
        let join_handle = tokio::spawn(async move {
            run_ingestion(db_pool, config, task_token).await;
        });

        Self {
            cancellation_token,
            join_handle,
        }
    }

    pub async fn stop(self) {
        self.cancellation_token.cancel();
        let _ = self.join_handle.await;
    }
}
