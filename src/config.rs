use crate::error::AppError;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_FEED_URL: &str = "wss://stream.binance.com:9443/ws";
pub const DEFAULT_EXCHANGE_REST_URL: &str = "https://api.binance.com";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://alerts.db";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8000";
pub const DEFAULT_HEARTBEAT_LIMIT_SECS: f64 = 60.0;
pub const DEFAULT_RECONCILE_PERIOD_SECS: f64 = 0.5;
pub const DEFAULT_CLIENT_RECEIVE_TIMEOUT_SECS: f64 = 0.5;
pub const DEFAULT_POOL_SIZE: u32 = 20;
pub const MIN_PERIOD_SECS: f64 = 0.01;
pub const MAX_PERIOD_SECS: f64 = 60.0;
pub const MIN_HEARTBEAT_LIMIT_SECS: f64 = 1.0;
pub const MAX_HEARTBEAT_LIMIT_SECS: f64 = 86_400.0;
pub const MAX_POOL_SIZE: u32 = 256;

/// Symbols accepted when neither the environment nor the exchange provides a list.
pub const FALLBACK_SUPPORTED_SYMBOLS: &[&str] = &[
    "btcusdt", "ethusdt", "bnbusdt", "solusdt", "xrpusdt", "adausdt", "dogeusdt", "etcusdt",
    "ltcusdt", "dotusdt", "linkusdt", "maticusdt", "trxusdt", "avaxusdt",
];

const ENV_FEED_URL: &str = "ALERTS_FEED_URL";
const ENV_EXCHANGE_REST_URL: &str = "ALERTS_EXCHANGE_REST_URL";
const ENV_DATABASE_URL: &str = "ALERTS_DATABASE_URL";
const ENV_LISTEN_ADDR: &str = "ALERTS_LISTEN_ADDR";
const ENV_HEARTBEAT_LIMIT: &str = "ALERTS_HEARTBEAT_LIMIT_SECS";
const ENV_RECONCILE_PERIOD: &str = "ALERTS_RECONCILE_PERIOD_SECS";
const ENV_CLIENT_RECEIVE_TIMEOUT: &str = "ALERTS_CLIENT_RECEIVE_TIMEOUT_SECS";
const ENV_POOL_SIZE: &str = "ALERTS_POOL_SIZE";
const ENV_SUPPORTED_SYMBOLS: &str = "ALERTS_SUPPORTED_SYMBOLS";

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, AppError> {
    match env_value(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::Config(format!("{key} has an invalid value '{raw}'"))),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlertsConfigArgs {
    pub feed_url: Option<String>,
    pub exchange_rest_url: Option<String>,
    pub database_url: Option<String>,
    pub listen_addr: Option<String>,
    pub heartbeat_limit_secs: Option<f64>,
    pub reconcile_period_secs: Option<f64>,
    pub client_receive_timeout_secs: Option<f64>,
    pub pool_size: Option<u32>,
    pub supported_symbols: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct AlertsConfig {
    pub feed_url: String,
    pub exchange_rest_url: String,
    pub database_url: String,
    pub listen_addr: SocketAddr,
    pub heartbeat_limit: Duration,
    pub reconcile_period: Duration,
    pub client_receive_timeout: Duration,
    pub pool_size: u32,
    /// `None` means the session process resolves the set from the exchange.
    pub supported_symbols: Option<Vec<String>>,
}

impl AlertsConfigArgs {
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self {
            feed_url: env_value(ENV_FEED_URL),
            exchange_rest_url: env_value(ENV_EXCHANGE_REST_URL),
            database_url: env_value(ENV_DATABASE_URL),
            listen_addr: env_value(ENV_LISTEN_ADDR),
            heartbeat_limit_secs: parse_env(ENV_HEARTBEAT_LIMIT)?,
            reconcile_period_secs: parse_env(ENV_RECONCILE_PERIOD)?,
            client_receive_timeout_secs: parse_env(ENV_CLIENT_RECEIVE_TIMEOUT)?,
            pool_size: parse_env(ENV_POOL_SIZE)?,
            supported_symbols: env_value(ENV_SUPPORTED_SYMBOLS).map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|symbol| !symbol.is_empty())
                    .map(str::to_string)
                    .collect()
            }),
        })
    }

    pub fn normalize(self) -> Result<AlertsConfig, AppError> {
        let feed_url = self
            .feed_url
            .unwrap_or_else(|| DEFAULT_FEED_URL.to_string());
        if !(feed_url.starts_with("ws://") || feed_url.starts_with("wss://")) {
            return Err(AppError::Config(
                "feed url must use the ws:// or wss:// scheme".to_string(),
            ));
        }

        let exchange_rest_url = self
            .exchange_rest_url
            .unwrap_or_else(|| DEFAULT_EXCHANGE_REST_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let database_url = self
            .database_url
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let listen_addr_raw = self
            .listen_addr
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = listen_addr_raw.parse::<SocketAddr>().map_err(|_| {
            AppError::Config(format!("listen address '{listen_addr_raw}' is not host:port"))
        })?;

        let heartbeat_limit_secs = self
            .heartbeat_limit_secs
            .unwrap_or(DEFAULT_HEARTBEAT_LIMIT_SECS);
        if !(MIN_HEARTBEAT_LIMIT_SECS..=MAX_HEARTBEAT_LIMIT_SECS).contains(&heartbeat_limit_secs)
        {
            return Err(AppError::Config(format!(
                "heartbeat limit must be between {MIN_HEARTBEAT_LIMIT_SECS} and {MAX_HEARTBEAT_LIMIT_SECS} seconds"
            )));
        }

        let reconcile_period_secs = self
            .reconcile_period_secs
            .unwrap_or(DEFAULT_RECONCILE_PERIOD_SECS);
        let client_receive_timeout_secs = self
            .client_receive_timeout_secs
            .unwrap_or(DEFAULT_CLIENT_RECEIVE_TIMEOUT_SECS);
        for (name, value) in [
            ("reconcile period", reconcile_period_secs),
            ("client receive timeout", client_receive_timeout_secs),
        ] {
            if !(MIN_PERIOD_SECS..=MAX_PERIOD_SECS).contains(&value) {
                return Err(AppError::Config(format!(
                    "{name} must be between {MIN_PERIOD_SECS} and {MAX_PERIOD_SECS} seconds"
                )));
            }
        }

        let pool_size = self.pool_size.unwrap_or(DEFAULT_POOL_SIZE);
        if !(1..=MAX_POOL_SIZE).contains(&pool_size) {
            return Err(AppError::Config(format!(
                "pool size must be between 1 and {MAX_POOL_SIZE}"
            )));
        }

        let supported_symbols = self.supported_symbols.map(normalize_symbols);

        Ok(AlertsConfig {
            feed_url,
            exchange_rest_url,
            database_url,
            listen_addr,
            heartbeat_limit: Duration::from_secs_f64(heartbeat_limit_secs),
            reconcile_period: Duration::from_secs_f64(reconcile_period_secs),
            client_receive_timeout: Duration::from_secs_f64(client_receive_timeout_secs),
            pool_size,
            supported_symbols,
        })
    }
}

impl AlertsConfig {
    pub fn from_env() -> Result<Self, AppError> {
        AlertsConfigArgs::from_env()?.normalize()
    }

    pub fn heartbeat_limit_ms(&self) -> i64 {
        self.heartbeat_limit.as_millis().min(i64::MAX as u128) as i64
    }
}

pub fn normalize_symbols<I, S>(symbols: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized: Vec<String> = symbols
        .into_iter()
        .map(|symbol| symbol.as_ref().trim().to_ascii_lowercase())
        .filter(|symbol| !symbol.is_empty())
        .collect();
    normalized.sort_unstable();
    normalized.dedup();
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_defaults() {
        let config = AlertsConfigArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config.feed_url, DEFAULT_FEED_URL);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.heartbeat_limit, Duration::from_secs(60));
        assert_eq!(config.reconcile_period, Duration::from_millis(500));
        assert_eq!(config.client_receive_timeout, Duration::from_millis(500));
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.heartbeat_limit_ms(), 60_000);
        assert!(config.supported_symbols.is_none());
    }

    #[test]
    fn rejects_non_websocket_feed_url() {
        let result = AlertsConfigArgs {
            feed_url: Some("https://stream.binance.com".to_string()),
            ..Default::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_period_ranges() {
        let result = AlertsConfigArgs {
            reconcile_period_secs: Some(0.0),
            ..Default::default()
        }
        .normalize();
        assert!(result.is_err());

        let result = AlertsConfigArgs {
            client_receive_timeout_secs: Some(600.0),
            ..Default::default()
        }
        .normalize();
        assert!(result.is_err());
    }

    #[test]
    fn validates_pool_size() {
        let result = AlertsConfigArgs {
            pool_size: Some(0),
            ..Default::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn lowercases_and_dedups_supported_symbols() {
        let config = AlertsConfigArgs {
            supported_symbols: Some(vec![
                "BTCUSDT".to_string(),
                " ethusdt ".to_string(),
                "btcusdt".to_string(),
            ]),
            ..Default::default()
        }
        .normalize()
        .expect("symbols should normalize");

        assert_eq!(
            config.supported_symbols,
            Some(vec!["btcusdt".to_string(), "ethusdt".to_string()])
        );
    }
}
