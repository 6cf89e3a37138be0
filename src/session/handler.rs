use crate::alerts::persistence::{
    create_connection, finish_connection, finish_subscription, insert_subscription,
    list_live_subscriptions_for_connection, list_pending_notifications_for_connection,
    mark_notifications_delivered, refresh_heartbeats,
};
use crate::alerts::types::{
    parse_client_request, ClientAction, ClientRequest, Connection, Subscription,
};
use crate::error::{AppError, ClientError};
use crate::session::symbols::SupportedSymbols;
use futures_util::{Sink, SinkExt};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionReply {
    Subscribed(Subscription),
    Unsubscribed(Vec<Subscription>),
    /// Same (symbol, threshold) already live on this connection; nothing is sent back.
    Duplicate,
    Rejected(ClientError),
}

impl SessionReply {
    pub fn frames(&self) -> Result<Vec<String>, AppError> {
        let frames = match self {
            Self::Subscribed(subscription) => vec![simd_json::serde::to_string(subscription)?],
            Self::Unsubscribed(subscriptions) => {
                let mut frames = Vec::with_capacity(subscriptions.len());
                for subscription in subscriptions {
                    frames.push(simd_json::serde::to_string(subscription)?);
                }
                frames
            }
            Self::Duplicate => Vec::new(),
            Self::Rejected(error) => vec![simd_json::serde::to_string(error)?],
        };
        Ok(frames)
    }
}

/// One client session: its connection row, its subscriptions and their notifications.
#[derive(Debug)]
pub struct SessionHandler {
    connection: Connection,
    pool: SqlitePool,
    supported_symbols: Arc<SupportedSymbols>,
    heartbeat_limit_ms: i64,
    closed: bool,
}

impl SessionHandler {
    pub async fn open(
        pool: SqlitePool,
        supported_symbols: Arc<SupportedSymbols>,
        heartbeat_limit_ms: i64,
        now_ms: i64,
    ) -> Result<Self, AppError> {
        let connection = create_connection(&pool, now_ms).await?;
        info!(connection_id = %connection.id, "session opened");

        Ok(Self {
            connection,
            pool,
            supported_symbols,
            heartbeat_limit_ms,
            closed: false,
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.connection.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Malformed input becomes a `Rejected` reply; only store failures surface as errors.
    pub async fn handle_client_payload(
        &self,
        payload: &mut [u8],
        now_ms: i64,
    ) -> Result<SessionReply, AppError> {
        let request = match parse_client_request(payload) {
            Ok(request) => request,
            Err(error) => {
                debug!(%error, "rejecting malformed client message");
                return Ok(SessionReply::Rejected(ClientError::malformed(error)));
            }
        };

        if !self.supported_symbols.contains(&request.symbol) {
            return Ok(SessionReply::Rejected(ClientError::unsupported_symbol(
                &request.symbol,
            )));
        }

        match request.action {
            ClientAction::Subscribe => self.subscribe(request, now_ms).await,
            ClientAction::Unsubscribe => self.unsubscribe(request, now_ms).await,
        }
    }

    async fn matching_live_subscriptions(
        &self,
        request: &ClientRequest,
        now_ms: i64,
    ) -> Result<Vec<Subscription>, AppError> {
        let live = list_live_subscriptions_for_connection(
            &self.pool,
            &self.connection.id,
            now_ms,
            self.heartbeat_limit_ms,
        )
        .await?;

        Ok(live
            .into_iter()
            .filter(|subscription| {
                subscription.symbol == request.symbol
                    && subscription.price_threshold == request.threshold
            })
            .collect())
    }

    async fn subscribe(
        &self,
        request: ClientRequest,
        now_ms: i64,
    ) -> Result<SessionReply, AppError> {
        if !self
            .matching_live_subscriptions(&request, now_ms)
            .await?
            .is_empty()
        {
            debug!(
                symbol = %request.symbol,
                threshold = request.threshold,
                "duplicate subscription ignored"
            );
            return Ok(SessionReply::Duplicate);
        }

        let subscription = insert_subscription(
            &self.pool,
            &self.connection.id,
            &request.symbol,
            request.threshold,
            now_ms,
        )
        .await?;
        info!(
            subscription_id = %subscription.id,
            symbol = %subscription.symbol,
            threshold = subscription.price_threshold,
            "subscription created"
        );

        Ok(SessionReply::Subscribed(subscription))
    }

    async fn unsubscribe(
        &self,
        request: ClientRequest,
        now_ms: i64,
    ) -> Result<SessionReply, AppError> {
        let matching = self.matching_live_subscriptions(&request, now_ms).await?;
        if matching.is_empty() {
            return Ok(SessionReply::Rejected(ClientError::new(format!(
                "no live subscription for {} at {}",
                request.symbol, request.threshold
            ))));
        }

        let mut finished = Vec::with_capacity(matching.len());
        for subscription in matching {
            let Some(subscription) =
                finish_subscription(&self.pool, &subscription.id, now_ms).await?
            else {
                continue;
            };
            info!(
                subscription_id = %subscription.id,
                symbol = %subscription.symbol,
                "subscription finished by client"
            );
            finished.push(subscription);
        }

        Ok(SessionReply::Unsubscribed(finished))
    }

    /// Keeps this session's subscriptions live, then pushes every undelivered notification
    /// and marks what was pushed. A push failure still marks the notifications already sent.
    pub async fn deliver_pending<S>(&self, sink: &mut S, now_ms: i64) -> Result<usize, AppError>
    where
        S: Sink<Message> + Unpin,
        AppError: From<S::Error>,
    {
        let refreshed =
            refresh_heartbeats(&self.pool, &self.connection.id, now_ms, self.heartbeat_limit_ms)
                .await?;
        if refreshed > 0 {
            debug!(refreshed, "subscription heartbeats refreshed");
        }

        let pending =
            list_pending_notifications_for_connection(&self.pool, &self.connection.id).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut delivered = Vec::with_capacity(pending.len());
        let mut push_error = None;
        for notification in &pending {
            let payload = simd_json::serde::to_string(notification)?;
            match sink.send(Message::Text(payload)).await {
                Ok(()) => {
                    debug!(
                        subscription_id = %notification.subscription_id,
                        notification_id = %notification.id,
                        "notification pushed"
                    );
                    delivered.push(notification.id.clone());
                }
                Err(error) => {
                    push_error = Some(AppError::from(error));
                    break;
                }
            }
        }

        mark_notifications_delivered(&self.pool, &delivered, now_ms).await?;
        match push_error {
            Some(error) => Err(error),
            None => Ok(delivered.len()),
        }
    }

    /// Finishes the connection and releases its subscriptions. Later calls are no-ops.
    pub async fn close(&mut self, now_ms: i64) -> Result<(), AppError> {
        if self.closed {
            return Ok(());
        }

        let released = finish_connection(&self.pool, &self.connection.id, now_ms).await?;
        self.closed = true;
        info!(released, "session closed");
        Ok(())
    }
}
