use crate::alerts::types::{
    datetime_from_ms, Connection, NewNotification, Notification, Subscription,
};
use crate::error::AppError;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const SUBSCRIPTION_COLUMNS: &str =
    "id, connection_id, symbol, price_threshold, created_at_ms, last_heartbeat_ms, finished_at_ms";
const NOTIFICATION_COLUMNS: &str =
    "id, subscription_id, symbol, message, order_ref, created_at_ms, finished_at_ms";

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn live_cutoff_ms(now_ms: i64, heartbeat_limit_ms: i64) -> i64 {
    now_ms.saturating_sub(heartbeat_limit_ms)
}

fn map_connection_row(row: &SqliteRow) -> Result<Connection, AppError> {
    let created_at_ms: i64 = row.try_get("created_at_ms")?;
    let finished_at_ms: Option<i64> = row.try_get("finished_at_ms")?;

    Ok(Connection {
        id: row.try_get("id")?,
        created_at: datetime_from_ms(created_at_ms),
        finished_at: finished_at_ms.map(datetime_from_ms),
    })
}

fn map_subscription_row(row: &SqliteRow) -> Result<Subscription, AppError> {
    let created_at_ms: i64 = row.try_get("created_at_ms")?;
    let last_heartbeat_ms: i64 = row.try_get("last_heartbeat_ms")?;
    let finished_at_ms: Option<i64> = row.try_get("finished_at_ms")?;

    Ok(Subscription {
        id: row.try_get("id")?,
        connection_id: row.try_get("connection_id")?,
        symbol: row.try_get("symbol")?,
        price_threshold: row.try_get("price_threshold")?,
        created_at: datetime_from_ms(created_at_ms),
        last_heartbeat: datetime_from_ms(last_heartbeat_ms),
        finished_at: finished_at_ms.map(datetime_from_ms),
    })
}

fn map_notification_row(row: &SqliteRow) -> Result<Notification, AppError> {
    let created_at_ms: i64 = row.try_get("created_at_ms")?;
    let finished_at_ms: Option<i64> = row.try_get("finished_at_ms")?;

    Ok(Notification {
        id: row.try_get("id")?,
        subscription_id: row.try_get("subscription_id")?,
        symbol: row.try_get("symbol")?,
        message: row.try_get("message")?,
        order_ref: row.try_get("order_ref")?,
        created_at: datetime_from_ms(created_at_ms),
        finished_at: finished_at_ms.map(datetime_from_ms),
    })
}

fn map_rows<T>(
    rows: &[SqliteRow],
    mapper: fn(&SqliteRow) -> Result<T, AppError>,
) -> Result<Vec<T>, AppError> {
    let mut mapped = Vec::with_capacity(rows.len());
    for row in rows {
        mapped.push(mapper(row)?);
    }
    Ok(mapped)
}

// Connections

pub async fn create_connection(pool: &SqlitePool, now_ms: i64) -> Result<Connection, AppError> {
    let connection_id = new_id();
    sqlx::query("INSERT INTO connections (id, created_at_ms) VALUES (?, ?)")
        .bind(&connection_id)
        .bind(now_ms)
        .execute(pool)
        .await?;

    Ok(Connection {
        id: connection_id,
        created_at: datetime_from_ms(now_ms),
        finished_at: None,
    })
}

pub async fn get_connection(
    pool: &SqlitePool,
    connection_id: &str,
) -> Result<Option<Connection>, AppError> {
    let row = sqlx::query("SELECT id, created_at_ms, finished_at_ms FROM connections WHERE id = ?")
        .bind(connection_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(map_connection_row).transpose()
}

/// Finishes the connection and every subscription it still owns in one transaction.
/// Returns the number of subscriptions released.
pub async fn finish_connection(
    pool: &SqlitePool,
    connection_id: &str,
    now_ms: i64,
) -> Result<u64, AppError> {
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE connections SET finished_at_ms = ? WHERE id = ? AND finished_at_ms IS NULL")
        .bind(now_ms)
        .bind(connection_id)
        .execute(&mut *tx)
        .await?;

    let released = sqlx::query(
        "UPDATE subscriptions SET finished_at_ms = ? WHERE connection_id = ? AND finished_at_ms IS NULL",
    )
    .bind(now_ms)
    .bind(connection_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(released.rows_affected())
}

// Subscriptions

pub async fn insert_subscription(
    pool: &SqlitePool,
    connection_id: &str,
    symbol: &str,
    price_threshold: f64,
    now_ms: i64,
) -> Result<Subscription, AppError> {
    let subscription = Subscription {
        id: new_id(),
        connection_id: connection_id.to_string(),
        symbol: symbol.to_ascii_lowercase(),
        price_threshold,
        created_at: datetime_from_ms(now_ms),
        last_heartbeat: datetime_from_ms(now_ms),
        finished_at: None,
    };

    sqlx::query(
        "INSERT INTO subscriptions (id, connection_id, symbol, price_threshold, created_at_ms, last_heartbeat_ms) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&subscription.id)
    .bind(&subscription.connection_id)
    .bind(&subscription.symbol)
    .bind(subscription.price_threshold)
    .bind(now_ms)
    .bind(now_ms)
    .execute(pool)
    .await?;

    Ok(subscription)
}

pub async fn finish_subscription(
    pool: &SqlitePool,
    subscription_id: &str,
    now_ms: i64,
) -> Result<Option<Subscription>, AppError> {
    let result = sqlx::query(
        "UPDATE subscriptions SET finished_at_ms = ? WHERE id = ? AND finished_at_ms IS NULL",
    )
    .bind(now_ms)
    .bind(subscription_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Ok(None);
    }

    let row = sqlx::query(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = ?"
    ))
    .bind(subscription_id)
    .fetch_one(pool)
    .await?;

    map_subscription_row(&row).map(Some)
}

/// Distinct symbols with at least one live subscription: the reconciler's desired set.
pub async fn list_live_symbols(
    pool: &SqlitePool,
    now_ms: i64,
    heartbeat_limit_ms: i64,
) -> Result<Vec<String>, AppError> {
    let symbols = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT symbol FROM subscriptions \
         WHERE finished_at_ms IS NULL AND last_heartbeat_ms > ? \
         ORDER BY symbol ASC",
    )
    .bind(live_cutoff_ms(now_ms, heartbeat_limit_ms))
    .fetch_all(pool)
    .await?;

    Ok(symbols)
}

pub async fn list_live_subscriptions_for_symbol(
    pool: &SqlitePool,
    symbol: &str,
    now_ms: i64,
    heartbeat_limit_ms: i64,
) -> Result<Vec<Subscription>, AppError> {
    let rows = sqlx::query(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
         WHERE symbol = ? AND finished_at_ms IS NULL AND last_heartbeat_ms > ? \
         ORDER BY created_at_ms ASC, id ASC"
    ))
    .bind(symbol.to_ascii_lowercase())
    .bind(live_cutoff_ms(now_ms, heartbeat_limit_ms))
    .fetch_all(pool)
    .await?;

    map_rows(&rows, map_subscription_row)
}

pub async fn list_live_subscriptions_for_connection(
    pool: &SqlitePool,
    connection_id: &str,
    now_ms: i64,
    heartbeat_limit_ms: i64,
) -> Result<Vec<Subscription>, AppError> {
    let rows = sqlx::query(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
         WHERE connection_id = ? AND finished_at_ms IS NULL AND last_heartbeat_ms > ? \
         ORDER BY created_at_ms ASC, id ASC"
    ))
    .bind(connection_id)
    .bind(live_cutoff_ms(now_ms, heartbeat_limit_ms))
    .fetch_all(pool)
    .await?;

    map_rows(&rows, map_subscription_row)
}

/// Refreshes heartbeats older than half the window for the connection's open subscriptions.
pub async fn refresh_heartbeats(
    pool: &SqlitePool,
    connection_id: &str,
    now_ms: i64,
    heartbeat_limit_ms: i64,
) -> Result<u64, AppError> {
    let stale_before_ms = now_ms.saturating_sub(heartbeat_limit_ms / 2);
    let result = sqlx::query(
        "UPDATE subscriptions SET last_heartbeat_ms = ? \
         WHERE connection_id = ? AND finished_at_ms IS NULL AND last_heartbeat_ms < ?",
    )
    .bind(now_ms)
    .bind(connection_id)
    .bind(stale_before_ms)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

// Notification sink: ingestion enqueues per subscription, sessions dequeue per connection.

/// Writes every notification produced by one tick, or none of them.
pub async fn enqueue_notifications(
    pool: &SqlitePool,
    batch: &[NewNotification],
    now_ms: i64,
) -> Result<Vec<Notification>, AppError> {
    if batch.is_empty() {
        return Ok(Vec::new());
    }

    let mut tx = pool.begin().await?;
    let mut stored = Vec::with_capacity(batch.len());
    for pending in batch {
        let notification = Notification {
            id: new_id(),
            subscription_id: pending.subscription_id.clone(),
            symbol: pending.symbol.clone(),
            message: pending.message.clone(),
            order_ref: pending.order_ref,
            created_at: datetime_from_ms(now_ms),
            finished_at: None,
        };

        sqlx::query(
            "INSERT INTO notifications (id, subscription_id, symbol, message, order_ref, created_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&notification.id)
        .bind(&notification.subscription_id)
        .bind(&notification.symbol)
        .bind(&notification.message)
        .bind(notification.order_ref)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;

        stored.push(notification);
    }
    tx.commit().await?;

    Ok(stored)
}

pub async fn list_pending_notifications_for_connection(
    pool: &SqlitePool,
    connection_id: &str,
) -> Result<Vec<Notification>, AppError> {
    let rows = sqlx::query(
        "SELECT n.id, n.subscription_id, n.symbol, n.message, n.order_ref, n.created_at_ms, n.finished_at_ms \
         FROM notifications n \
         JOIN subscriptions s ON s.id = n.subscription_id \
         WHERE s.connection_id = ? AND s.finished_at_ms IS NULL AND n.finished_at_ms IS NULL \
         ORDER BY n.created_at_ms ASC, n.id ASC",
    )
    .bind(connection_id)
    .fetch_all(pool)
    .await?;

    map_rows(&rows, map_notification_row)
}

pub async fn list_notifications_for_subscription(
    pool: &SqlitePool,
    subscription_id: &str,
) -> Result<Vec<Notification>, AppError> {
    let rows = sqlx::query(&format!(
        "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE subscription_id = ? \
         ORDER BY created_at_ms ASC, id ASC"
    ))
    .bind(subscription_id)
    .fetch_all(pool)
    .await?;

    map_rows(&rows, map_notification_row)
}

/// Marks notifications delivered. Already-delivered ids are left untouched, so each
/// notification is finished at most once.
pub async fn mark_notifications_delivered(
    pool: &SqlitePool,
    notification_ids: &[String],
    now_ms: i64,
) -> Result<u64, AppError> {
    if notification_ids.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;
    let mut marked = 0_u64;
    for notification_id in notification_ids {
        let result = sqlx::query(
            "UPDATE notifications SET finished_at_ms = ? WHERE id = ? AND finished_at_ms IS NULL",
        )
        .bind(now_ms)
        .bind(notification_id)
        .execute(&mut *tx)
        .await?;
        marked += result.rows_affected();
    }
    tx.commit().await?;

    Ok(marked)
}
