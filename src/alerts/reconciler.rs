use crate::alerts::persistence::{list_live_symbols, now_unix_ms};
use crate::alerts::types::{FeedCommand, FeedMethod};
use crate::error::AppError;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Process-local request id source for outbound feed commands. Shared across feed
/// reconnects so ids keep increasing for the life of the process.
#[derive(Debug, Clone, Default)]
pub struct FeedRequestIds {
    last_id: Arc<AtomicU64>,
}

impl FeedRequestIds {
    pub fn next(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn last(&self) -> u64 {
        self.last_id.load(Ordering::Relaxed)
    }
}

/// Hands a command to the feed transport. Delivery and acknowledgement are not awaited.
pub trait FeedCommandSink {
    fn submit(&mut self, command: FeedCommand) -> Result<(), AppError>;
}

impl FeedCommandSink for UnboundedSender<FeedCommand> {
    fn submit(&mut self, command: FeedCommand) -> Result<(), AppError> {
        self.send(command).map_err(|_| AppError::FeedChannelClosed)
    }
}

impl FeedCommandSink for Vec<FeedCommand> {
    fn submit(&mut self, command: FeedCommand) -> Result<(), AppError> {
        self.push(command);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub to_subscribe: Vec<String>,
    pub to_unsubscribe: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_subscribe.is_empty() && self.to_unsubscribe.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub subscribed: Vec<String>,
    pub unsubscribed: Vec<String>,
    pub failed: Vec<String>,
}

/// Owns the set of symbols currently subscribed on one feed connection.
#[derive(Debug)]
pub struct SubscriptionReconciler {
    subscribed: BTreeSet<String>,
    request_ids: FeedRequestIds,
    heartbeat_limit_ms: i64,
}

impl SubscriptionReconciler {
    pub fn new(request_ids: FeedRequestIds, heartbeat_limit_ms: i64) -> Self {
        Self {
            subscribed: BTreeSet::new(),
            request_ids,
            heartbeat_limit_ms,
        }
    }

    pub fn subscribed(&self) -> &BTreeSet<String> {
        &self.subscribed
    }

    pub fn plan<I, S>(&self, desired: I) -> ReconcilePlan
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let desired: BTreeSet<String> = desired
            .into_iter()
            .map(|symbol| symbol.as_ref().to_ascii_lowercase())
            .collect();

        ReconcilePlan {
            to_subscribe: desired.difference(&self.subscribed).cloned().collect(),
            to_unsubscribe: self.subscribed.difference(&desired).cloned().collect(),
        }
    }

    /// Issues feed commands for the plan. A symbol only changes state once its command
    /// was handed to the sink, so a rejected command is retried by the next run.
    pub fn apply<K: FeedCommandSink>(
        &mut self,
        plan: ReconcilePlan,
        sink: &mut K,
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        let commands = plan
            .to_subscribe
            .into_iter()
            .map(|symbol| (FeedMethod::Subscribe, symbol))
            .chain(
                plan.to_unsubscribe
                    .into_iter()
                    .map(|symbol| (FeedMethod::Unsubscribe, symbol)),
            );

        for (method, symbol) in commands {
            let command = FeedCommand::new(method, &symbol, self.request_ids.next());
            let request_id = command.id;
            match sink.submit(command) {
                Ok(()) => {
                    debug!(%symbol, request_id, ?method, "feed command submitted");
                    match method {
                        FeedMethod::Subscribe => {
                            self.subscribed.insert(symbol.clone());
                            outcome.subscribed.push(symbol);
                        }
                        FeedMethod::Unsubscribe => {
                            self.subscribed.remove(&symbol);
                            outcome.unsubscribed.push(symbol);
                        }
                    }
                }
                Err(error) => {
                    warn!(%symbol, request_id, ?method, %error, "failed to submit feed command");
                    outcome.failed.push(symbol);
                }
            }
        }

        outcome
    }

    /// One reconciliation run against the store. Errors abandon the run; the caller simply
    /// tries again on the next period.
    pub async fn reconcile<K: FeedCommandSink>(
        &mut self,
        pool: &SqlitePool,
        sink: &mut K,
        now_ms: i64,
    ) -> Result<ReconcileOutcome, AppError> {
        let desired = list_live_symbols(pool, now_ms, self.heartbeat_limit_ms).await?;
        let plan = self.plan(&desired);
        if plan.is_empty() {
            return Ok(ReconcileOutcome::default());
        }

        let outcome = self.apply(plan, sink);
        info!(
            subscribed = ?outcome.subscribed,
            unsubscribed = ?outcome.unsubscribed,
            failed = ?outcome.failed,
            active = self.subscribed.len(),
            "feed subscriptions reconciled"
        );
        Ok(outcome)
    }

    pub async fn reconcile_now<K: FeedCommandSink>(
        &mut self,
        pool: &SqlitePool,
        sink: &mut K,
    ) -> Result<ReconcileOutcome, AppError> {
        self.reconcile(pool, sink, now_unix_ms()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::persistence::{create_connection, finish_subscription, insert_subscription};
    use crate::db::initialize_memory_pool;

    const WINDOW_MS: i64 = 60_000;

    struct ClosedSink;

    impl FeedCommandSink for ClosedSink {
        fn submit(&mut self, _command: FeedCommand) -> Result<(), AppError> {
            Err(AppError::FeedChannelClosed)
        }
    }

    #[test]
    fn plans_symmetric_difference() {
        let mut reconciler = SubscriptionReconciler::new(FeedRequestIds::default(), WINDOW_MS);
        let mut sent = Vec::new();
        reconciler.apply(reconciler.plan(["btcusdt", "ethusdt"]), &mut sent);

        let plan = reconciler.plan(["ETHUSDT", "solusdt"]);
        assert_eq!(
            plan,
            ReconcilePlan {
                to_subscribe: vec!["solusdt".to_string()],
                to_unsubscribe: vec!["btcusdt".to_string()],
            }
        );
    }

    #[test]
    fn request_ids_increase_monotonically() {
        let ids = FeedRequestIds::default();
        let mut reconciler = SubscriptionReconciler::new(ids.clone(), WINDOW_MS);
        let mut sent = Vec::new();

        reconciler.apply(reconciler.plan(["btcusdt", "ethusdt"]), &mut sent);
        reconciler.apply(reconciler.plan(["ethusdt"]), &mut sent);

        let sent_ids: Vec<u64> = sent.iter().map(|command| command.id).collect();
        assert_eq!(sent_ids, vec![1, 2, 3]);
        assert_eq!(sent[2], FeedCommand::unsubscribe("btcusdt", 3));
        assert_eq!(ids.last(), 3);

        let mut next_connection = SubscriptionReconciler::new(ids, WINDOW_MS);
        next_connection.apply(next_connection.plan(["btcusdt"]), &mut sent);
        assert_eq!(sent.last().map(|command| command.id), Some(4));
    }

    #[test]
    fn rejected_commands_are_retried_next_run() {
        let mut reconciler = SubscriptionReconciler::new(FeedRequestIds::default(), WINDOW_MS);

        let outcome = reconciler.apply(reconciler.plan(["btcusdt"]), &mut ClosedSink);
        assert_eq!(outcome.failed, vec!["btcusdt".to_string()]);
        assert!(reconciler.subscribed().is_empty());

        let mut sent = Vec::new();
        let outcome = reconciler.apply(reconciler.plan(["btcusdt"]), &mut sent);
        assert_eq!(outcome.subscribed, vec!["btcusdt".to_string()]);
        assert_eq!(sent.len(), 1);
    }

    #[tokio::test]
    async fn converges_to_store_desired_set() {
        let pool = initialize_memory_pool().await.expect("pool");
        let now = 10_000_000;
        let conn = create_connection(&pool, now).await.expect("connection");
        let btc = insert_subscription(&pool, &conn.id, "btcusdt", 1000.0, now)
            .await
            .expect("subscription");
        insert_subscription(&pool, &conn.id, "ethusdt", 1000.0, now)
            .await
            .expect("subscription");

        let mut reconciler = SubscriptionReconciler::new(FeedRequestIds::default(), WINDOW_MS);
        let mut sent = Vec::new();
        reconciler
            .reconcile(&pool, &mut sent, now)
            .await
            .expect("first run");
        assert_eq!(
            reconciler.subscribed().iter().cloned().collect::<Vec<_>>(),
            vec!["btcusdt".to_string(), "ethusdt".to_string()]
        );

        finish_subscription(&pool, &btc.id, now + 1)
            .await
            .expect("finish");
        reconciler
            .reconcile(&pool, &mut sent, now + 1)
            .await
            .expect("second run");
        assert_eq!(
            reconciler.subscribed().iter().cloned().collect::<Vec<_>>(),
            vec!["ethusdt".to_string()]
        );

        let quiescent = reconciler
            .reconcile(&pool, &mut sent, now + 2)
            .await
            .expect("quiescent run");
        assert_eq!(quiescent, ReconcileOutcome::default());
        assert_eq!(sent.len(), 3);
    }

    #[tokio::test]
    async fn expired_heartbeat_leaves_desired_set() {
        let pool = initialize_memory_pool().await.expect("pool");
        let now = 20_000_000;
        let conn = create_connection(&pool, now).await.expect("connection");
        insert_subscription(&pool, &conn.id, "btcusdt", 1000.0, now)
            .await
            .expect("subscription");

        let mut reconciler = SubscriptionReconciler::new(FeedRequestIds::default(), WINDOW_MS);
        let mut sent = Vec::new();
        reconciler
            .reconcile(&pool, &mut sent, now)
            .await
            .expect("first run");
        assert!(reconciler.subscribed().contains("btcusdt"));

        reconciler
            .reconcile(&pool, &mut sent, now + WINDOW_MS + 1)
            .await
            .expect("run after expiry");
        assert!(reconciler.subscribed().is_empty());
        assert_eq!(sent.last(), Some(&FeedCommand::unsubscribe("btcusdt", 2)));
    }
}
