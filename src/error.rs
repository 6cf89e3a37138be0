use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("float parse error: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error("feed protocol error: {0}")]
    FeedProtocol(String),
    #[error("feed command channel closed")]
    FeedChannelClosed,
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl From<std::convert::Infallible> for AppError {
    fn from(value: std::convert::Infallible) -> Self {
        match value {}
    }
}

/// Client-visible error frame. Sending one never closes the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientError {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: String,
}

impl ClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: "error",
            message: message.into(),
        }
    }

    pub fn unsupported_symbol(symbol: &str) -> Self {
        Self::new(format!(
            "symbol '{symbol}' is not valid, check https://api.binance.com/api/v3/exchangeInfo to get the available symbols"
        ))
    }

    pub fn malformed(detail: impl std::fmt::Display) -> Self {
        Self::new(format!(
            "invalid subscription message ({detail}), e.g. {{\"symbol\": \"btcusdt\", \"threshold\": \"20356.11\"}}"
        ))
    }
}
