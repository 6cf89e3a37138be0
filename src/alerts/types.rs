use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TRADE_EVENT_TYPE: &str = "trade";
pub const TRADE_STREAM_SUFFIX: &str = "@trade";

pub fn datetime_from_ms(timestamp_ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms).unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub id: String,
    pub connection_id: String,
    pub symbol: String,
    pub price_threshold: f64,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub last_heartbeat: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: String,
    pub subscription_id: String,
    pub symbol: String,
    pub message: String,
    pub order_ref: i64,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A notification about to be written; ids and timestamps are assigned by the store layer.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub subscription_id: String,
    pub symbol: String,
    pub message: String,
    pub order_ref: i64,
}

impl NewNotification {
    pub fn for_crossing(subscription: &Subscription, current_price: f64, order_ref: i64) -> Self {
        Self {
            subscription_id: subscription.id.clone(),
            symbol: subscription.symbol.clone(),
            message: format!("Price has surpassed the threshold: {current_price}"),
            order_ref,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum FeedMethod {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedCommand {
    pub method: FeedMethod,
    pub params: Vec<String>,
    pub id: u64,
}

impl FeedCommand {
    pub fn new(method: FeedMethod, symbol: &str, id: u64) -> Self {
        Self {
            method,
            params: vec![format!(
                "{}{TRADE_STREAM_SUFFIX}",
                symbol.to_ascii_lowercase()
            )],
            id,
        }
    }

    pub fn subscribe(symbol: &str, id: u64) -> Self {
        Self::new(FeedMethod::Subscribe, symbol, id)
    }

    pub fn unsubscribe(symbol: &str, id: u64) -> Self {
        Self::new(FeedMethod::Unsubscribe, symbol, id)
    }

    pub fn to_json(&self) -> Result<String, AppError> {
        Ok(simd_json::serde::to_string(self)?)
    }
}

/// Superset of every field the feed may send; narrowed by `FeedEvent::try_from`.
#[derive(Debug, Deserialize)]
pub struct FeedMessageWire {
    #[serde(rename = "e")]
    pub event_type: Option<String>,
    #[serde(rename = "E")]
    pub event_time: Option<i64>,
    #[serde(rename = "s")]
    pub symbol: Option<String>,
    #[serde(rename = "p")]
    pub price: Option<String>,
    pub id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeTick {
    pub symbol: String,
    pub price: f64,
    pub event_time: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Trade(TradeTick),
    CommandAck { id: u64 },
    Other { event_type: Option<String> },
}

impl TryFrom<FeedMessageWire> for FeedEvent {
    type Error = AppError;

    fn try_from(value: FeedMessageWire) -> Result<Self, Self::Error> {
        if value.event_type.is_none() {
            return Ok(match value.id {
                Some(id) => Self::CommandAck { id },
                None => Self::Other { event_type: None },
            });
        }
        if value.event_type.as_deref() != Some(TRADE_EVENT_TYPE) {
            return Ok(Self::Other {
                event_type: value.event_type,
            });
        }

        let symbol = value
            .symbol
            .map(|symbol| symbol.trim().to_ascii_lowercase())
            .filter(|symbol| !symbol.is_empty())
            .ok_or_else(|| AppError::FeedProtocol("trade event without symbol".to_string()))?;
        let raw_price = value
            .price
            .ok_or_else(|| AppError::FeedProtocol("trade event without price".to_string()))?;
        let event_time = value
            .event_time
            .ok_or_else(|| AppError::FeedProtocol("trade event without event time".to_string()))?;

        let price = raw_price.trim().parse::<f64>()?;
        if !price.is_finite() || price <= 0.0 {
            return Err(AppError::FeedProtocol(
                "trade price must be finite and positive".to_string(),
            ));
        }

        Ok(Self::Trade(TradeTick {
            symbol,
            price,
            event_time,
        }))
    }
}

pub fn parse_feed_payload(payload: &mut [u8]) -> Result<FeedEvent, AppError> {
    let wire: FeedMessageWire = simd_json::serde::from_slice(payload)?;
    wire.try_into()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientAction {
    #[default]
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Deserialize)]
pub struct ClientRequestWire {
    #[serde(default)]
    pub action: Option<ClientAction>,
    pub symbol: String,
    pub threshold: ThresholdWire,
}

/// Clients send the threshold either as a decimal string or as a bare JSON number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ThresholdWire {
    Number(f64),
    Text(String),
}

impl ThresholdWire {
    fn parse(&self) -> Result<f64, AppError> {
        match self {
            Self::Number(value) => Ok(*value),
            Self::Text(raw) => Ok(raw.trim().parse::<f64>()?),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientRequest {
    pub action: ClientAction,
    pub symbol: String,
    pub threshold: f64,
}

impl TryFrom<ClientRequestWire> for ClientRequest {
    type Error = AppError;

    fn try_from(value: ClientRequestWire) -> Result<Self, Self::Error> {
        let symbol = value.symbol.trim().to_ascii_lowercase();
        if symbol.is_empty() || !symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return Err(AppError::InvalidArgument(
                "symbol must be non-empty alphanumeric ASCII".to_string(),
            ));
        }

        let threshold = value.threshold.parse()?;
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(AppError::InvalidArgument(
                "threshold must be a finite positive number".to_string(),
            ));
        }

        Ok(Self {
            action: value.action.unwrap_or_default(),
            symbol,
            threshold,
        })
    }
}

pub fn parse_client_request(payload: &mut [u8]) -> Result<ClientRequest, AppError> {
    let wire: ClientRequestWire = simd_json::serde::from_slice(payload)?;
    wire.try_into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trade_payload_and_lowercases_symbol() {
        let mut payload =
            br#"{"e":"trade","E":123456789,"s":"BTCUSDT","t":12345,"p":"1000.50000000","q":"0.1","b":88,"a":50,"T":123456785,"m":true,"M":true}"#
                .to_vec();
        let event = parse_feed_payload(&mut payload).expect("trade payload should parse");

        assert_eq!(
            event,
            FeedEvent::Trade(TradeTick {
                symbol: "btcusdt".to_string(),
                price: 1000.5,
                event_time: 123456789,
            })
        );
    }

    #[test]
    fn non_trade_events_are_not_ticks() {
        let mut payload =
            br#"{"e":"aggTrade","E":1,"s":"BTCUSDT","p":"1.0"}"#.to_vec();
        let event = parse_feed_payload(&mut payload).expect("payload should decode");

        assert_eq!(
            event,
            FeedEvent::Other {
                event_type: Some("aggTrade".to_string())
            }
        );
    }

    #[test]
    fn recognizes_command_acknowledgement() {
        let mut payload = br#"{"result":null,"id":7}"#.to_vec();
        let event = parse_feed_payload(&mut payload).expect("ack should decode");

        assert_eq!(event, FeedEvent::CommandAck { id: 7 });
    }

    #[test]
    fn rejects_trade_without_price() {
        let mut payload = br#"{"e":"trade","E":1,"s":"BTCUSDT"}"#.to_vec();
        assert!(parse_feed_payload(&mut payload).is_err());
    }

    #[test]
    fn rejects_trade_with_broken_price() {
        let mut payload = br#"{"e":"trade","E":1,"s":"BTCUSDT","p":"broken"}"#.to_vec();
        assert!(parse_feed_payload(&mut payload).is_err());
    }

    #[test]
    fn feed_command_matches_wire_shape() {
        let command = FeedCommand::subscribe("BTCUSDT", 3);
        let json = command.to_json().expect("command should serialize");

        assert_eq!(
            json,
            r#"{"method":"SUBSCRIBE","params":["btcusdt@trade"],"id":3}"#
        );
        assert_eq!(FeedCommand::unsubscribe("ethusdt", 4).method, FeedMethod::Unsubscribe);
    }

    #[test]
    fn parses_client_subscribe_request() {
        let mut payload = br#"{"symbol": "BTCUSDT", "threshold": "20356.11"}"#.to_vec();
        let request = parse_client_request(&mut payload).expect("request should parse");

        assert_eq!(request.action, ClientAction::Subscribe);
        assert_eq!(request.symbol, "btcusdt");
        assert_eq!(request.threshold, 20356.11);
    }

    #[test]
    fn parses_client_unsubscribe_request() {
        let mut payload =
            br#"{"action":"unsubscribe","symbol":"ethusdt","threshold":"1000"}"#.to_vec();
        let request = parse_client_request(&mut payload).expect("request should parse");

        assert_eq!(request.action, ClientAction::Unsubscribe);
    }

    #[test]
    fn accepts_numeric_threshold() {
        for (raw, expected) in [
            (r#"{"symbol":"btcusdt","threshold":1000}"#, 1000.0),
            (r#"{"symbol":"btcusdt","threshold":20356.11}"#, 20356.11),
        ] {
            let mut payload = raw.as_bytes().to_vec();
            let request = parse_client_request(&mut payload).expect("numeric threshold parses");
            assert_eq!(request.threshold, expected);
        }

        let mut payload = br#"{"symbol":"btcusdt","threshold":0}"#.to_vec();
        assert!(parse_client_request(&mut payload).is_err());
    }

    #[test]
    fn rejects_malformed_client_requests() {
        for raw in [
            r#"{"symbol":"btcusdt"}"#,
            r#"{"symbol":"btcusdt","threshold":"-1"}"#,
            r#"{"symbol":"btcusdt","threshold":"abc"}"#,
            r#"{"symbol":"","threshold":"10"}"#,
            r#"{"symbol":"btcusdt","threshold":true}"#,
            r#"not json"#,
        ] {
            let mut payload = raw.as_bytes().to_vec();
            assert!(
                parse_client_request(&mut payload).is_err(),
                "expected rejection for {raw}"
            );
        }
    }

    #[test]
    fn subscription_serializes_without_heartbeat() {
        let subscription = Subscription {
            id: "s1".to_string(),
            connection_id: "c1".to_string(),
            symbol: "btcusdt".to_string(),
            price_threshold: 1000.0,
            created_at: datetime_from_ms(0),
            last_heartbeat: datetime_from_ms(0),
            finished_at: None,
        };
        let json = simd_json::serde::to_string(&subscription).expect("should serialize");

        assert!(json.contains(r#""created_at":"1970-01-01T00:00:00Z""#));
        assert!(json.contains(r#""finished_at":null"#));
        assert!(!json.contains("last_heartbeat"));
    }
}
