use crate::alerts::binance::{
    connect_feed_stream, reconnect_delay, send_feed_command, BinanceWsStream,
};
use crate::alerts::ingestion::{FeedDirective, IngestionLoop};
use crate::alerts::persistence::now_unix_ms;
use crate::alerts::reconciler::{FeedRequestIds, SubscriptionReconciler};
use crate::alerts::types::FeedCommand;
use crate::config::AlertsConfig;
use futures_util::{SinkExt, StreamExt};
use sqlx::SqlitePool;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const STABLE_CONNECTION: Duration = Duration::from_secs(30);

/// Drives the ingestion process until cancelled: keeps a feed connection open, reconciles
/// its subscriptions against the store and turns trade ticks into notifications.
pub async fn run_ingestion(
    pool: SqlitePool,
    config: AlertsConfig,
    cancel_token: CancellationToken,
) {
    let request_ids = FeedRequestIds::default();
    let mut ingestion = IngestionLoop::new(config.heartbeat_limit_ms());
    let mut reconnect_attempt = 0_u32;

    while !cancel_token.is_cancelled() {
        if reconnect_attempt == 0 {
            info!(feed_url = %config.feed_url, "opening feed stream");
        } else {
            info!(feed_url = %config.feed_url, reconnect_attempt, "reconnecting feed stream");
        }

        let connect = tokio::select! {
            _ = cancel_token.cancelled() => break,
            connect = connect_feed_stream(&config.feed_url) => connect,
        };

        match connect {
            Ok(websocket_stream) => {
                info!("feed stream connected");
                let connected_at = Instant::now();

                let directive = run_feed_connection(
                    &pool,
                    &config,
                    websocket_stream,
                    &mut ingestion,
                    &request_ids,
                    &cancel_token,
                )
                .await;

                if cancel_token.is_cancelled() || directive == FeedDirective::Continue {
                    break;
                }
                // Only a connection that stayed up resets the backoff; a feed that drops
                // right after the handshake keeps growing the delay.
                if connected_at.elapsed() >= STABLE_CONNECTION {
                    reconnect_attempt = 0;
                }
            }
            Err(error) => {
                warn!(%error, "feed connect error");
            }
        }

        reconnect_attempt = reconnect_attempt.saturating_add(1);
        let delay = reconnect_delay(reconnect_attempt, now_unix_ms());
        info!(
            delay_ms = delay.as_millis() as u64,
            reconnect_attempt,
            "feed reconnect scheduled"
        );
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!(last_request_id = request_ids.last(), "ingestion stopped");
}

async fn run_feed_connection(
    pool: &SqlitePool,
    config: &AlertsConfig,
    websocket_stream: BinanceWsStream,
    ingestion: &mut IngestionLoop,
    request_ids: &FeedRequestIds,
    cancel_token: &CancellationToken,
) -> FeedDirective {
    let (mut feed_sink, mut feed_stream) = websocket_stream.split();
    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<FeedCommand>();

    // A fresh connection carries no stream subscriptions, so each one gets its own reconciler.
    let connection_token = cancel_token.child_token();
    let reconciler_handle = spawn_reconciler(
        pool.clone(),
        config.reconcile_period,
        SubscriptionReconciler::new(request_ids.clone(), config.heartbeat_limit_ms()),
        command_tx,
        connection_token.clone(),
    );

    let directive = loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break FeedDirective::Continue,
            maybe_command = command_rx.recv() => {
                let Some(command) = maybe_command else {
                    break FeedDirective::Reconnect;
                };
                if let Err(error) = send_feed_command(&mut feed_sink, &command).await {
                    warn!(%error, request_id = command.id, "failed to send feed command");
                    break FeedDirective::Reconnect;
                }
            }
            next_message = feed_stream.next() => {
                match next_message {
                    Some(Ok(message)) => {
                        let directive = ingestion.handle_message(pool, message).await;
                        if directive == FeedDirective::Reconnect {
                            break FeedDirective::Reconnect;
                        }
                    }
                    Some(Err(error)) => {
                        warn!(%error, "feed frame error");
                        break FeedDirective::Reconnect;
                    }
                    None => {
                        warn!("feed stream ended");
                        break FeedDirective::Reconnect;
                    }
                }
            }
        }
    };

    connection_token.cancel();
    let _ = reconciler_handle.await;
    let _ = feed_sink.close().await;
    directive
}

fn spawn_reconciler(
    pool: SqlitePool,
    period: Duration,
    mut reconciler: SubscriptionReconciler,
    mut command_tx: UnboundedSender<FeedCommand>,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(error) = reconciler.reconcile_now(&pool, &mut command_tx).await {
                        warn!(%error, "reconciliation run skipped");
                    }
                }
            }
        }
    })
}
