use crate::alerts::crossing::{detect_crossings, may_cross};
use crate::alerts::persistence::{
    enqueue_notifications, list_live_subscriptions_for_symbol, now_unix_ms,
};
use crate::alerts::types::{parse_feed_payload, FeedEvent, NewNotification, TradeTick};
use crate::error::AppError;
use sqlx::SqlitePool;
use std::collections::HashMap;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// First observation of the symbol; nothing to compare against.
    Primed,
    Evaluated { notified: usize },
    StoreFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedDirective {
    Continue,
    Reconnect,
}

/// Last observed price per symbol, owned by a single ingestion runtime.
#[derive(Debug)]
pub struct IngestionLoop {
    previous_prices: HashMap<String, f64>,
    heartbeat_limit_ms: i64,
}

impl IngestionLoop {
    pub fn new(heartbeat_limit_ms: i64) -> Self {
        Self {
            previous_prices: HashMap::new(),
            heartbeat_limit_ms,
        }
    }

    pub fn previous_price(&self, symbol: &str) -> Option<f64> {
        self.previous_prices.get(symbol).copied()
    }

    pub fn previous_prices(&self) -> &HashMap<String, f64> {
        &self.previous_prices
    }

    /// Runs crossing detection for one tick and records the price afterwards, whatever the
    /// store did. Live subscriptions are read fresh on every tick.
    pub async fn handle_tick(
        &mut self,
        pool: &SqlitePool,
        tick: &TradeTick,
        now_ms: i64,
    ) -> TickOutcome {
        let previous_price = self.previous_price(&tick.symbol);
        let outcome = self.evaluate(pool, tick, previous_price, now_ms).await;
        self.previous_prices.insert(tick.symbol.clone(), tick.price);
        outcome
    }

    async fn evaluate(
        &self,
        pool: &SqlitePool,
        tick: &TradeTick,
        previous_price: Option<f64>,
        now_ms: i64,
    ) -> TickOutcome {
        if previous_price.is_none() {
            return TickOutcome::Primed;
        }
        if !may_cross(previous_price, tick.price) {
            return TickOutcome::Evaluated { notified: 0 };
        }

        let batch = match self.crossing_batch(pool, tick, previous_price, now_ms).await {
            Ok(batch) => batch,
            Err(error) => {
                warn!(
                    symbol = %tick.symbol,
                    %error,
                    "failed to load live subscriptions, tick dropped"
                );
                return TickOutcome::StoreFailed;
            }
        };
        if batch.is_empty() {
            return TickOutcome::Evaluated { notified: 0 };
        }

        match enqueue_notifications(pool, &batch, now_ms).await {
            Ok(stored) => {
                for notification in &stored {
                    info!(
                        symbol = %notification.symbol,
                        subscription_id = %notification.subscription_id,
                        notification_id = %notification.id,
                        price = tick.price,
                        "threshold crossing recorded"
                    );
                }
                TickOutcome::Evaluated {
                    notified: stored.len(),
                }
            }
            Err(error) => {
                warn!(
                    symbol = %tick.symbol,
                    %error,
                    batch = batch.len(),
                    "failed to persist notifications, tick dropped"
                );
                TickOutcome::StoreFailed
            }
        }
    }

    async fn crossing_batch(
        &self,
        pool: &SqlitePool,
        tick: &TradeTick,
        previous_price: Option<f64>,
        now_ms: i64,
    ) -> Result<Vec<NewNotification>, AppError> {
        let subscriptions =
            list_live_subscriptions_for_symbol(pool, &tick.symbol, now_ms, self.heartbeat_limit_ms)
                .await?;

        Ok(detect_crossings(previous_price, tick.price, &subscriptions)
            .into_iter()
            .map(|subscription| {
                NewNotification::for_crossing(subscription, tick.price, tick.event_time)
            })
            .collect())
    }

    pub async fn handle_payload(
        &mut self,
        pool: &SqlitePool,
        payload: &mut [u8],
    ) -> Option<TickOutcome> {
        match parse_feed_payload(payload) {
            Ok(FeedEvent::Trade(tick)) => Some(self.handle_tick(pool, &tick, now_unix_ms()).await),
            Ok(FeedEvent::CommandAck { id }) => {
                debug!(request_id = id, "feed command acknowledged");
                None
            }
            Ok(FeedEvent::Other { event_type }) => {
                debug!(?event_type, "ignoring non-trade feed event");
                None
            }
            Err(error) => {
                warn!(%error, "failed to decode feed payload");
                None
            }
        }
    }

    pub async fn handle_message(&mut self, pool: &SqlitePool, message: Message) -> FeedDirective {
        match message {
            Message::Text(text_payload) => {
                let mut owned_payload = text_payload.into_bytes();
                self.handle_payload(pool, owned_payload.as_mut_slice()).await;
                FeedDirective::Continue
            }
            Message::Binary(mut binary_payload) => {
                self.handle_payload(pool, binary_payload.as_mut_slice()).await;
                FeedDirective::Continue
            }
            Message::Close(frame) => {
                info!(?frame, "feed sent close frame");
                FeedDirective::Reconnect
            }
            _ => FeedDirective::Continue,
        }
    }
}
