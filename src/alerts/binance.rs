use crate::alerts::types::FeedCommand;
use crate::config::normalize_symbols;
use crate::error::AppError;
use futures_util::{Sink, SinkExt};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

pub type BinanceWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECONNECT_BASE_DELAY_MS: u64 = 200;
const RECONNECT_MAX_DELAY_MS: u64 = 5_000;

fn spot_symbols_endpoint(rest_base_url: &str) -> String {
    format!("{rest_base_url}/api/v3/exchangeInfo?permissions=SPOT")
}

pub async fn connect_feed_stream(feed_url: &str) -> Result<BinanceWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(feed_url, Some(ws_config), true).await?;
    Ok(stream)
}

pub async fn send_feed_command<S>(sink: &mut S, command: &FeedCommand) -> Result<(), AppError>
where
    S: Sink<Message> + Unpin,
    AppError: From<S::Error>,
{
    let payload = command.to_json()?;
    sink.send(Message::Text(payload)).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct BinanceExchangeInfoWire {
    symbols: Vec<BinanceExchangeSymbolWire>,
}

#[derive(Debug, Deserialize)]
struct BinanceExchangeSymbolWire {
    symbol: String,
    status: String,
    #[serde(rename = "isSpotTradingAllowed")]
    is_spot_trading_allowed: bool,
}

/// Lower-cased symbols currently trading on the spot market.
pub async fn fetch_spot_symbols(
    client: &Client,
    rest_base_url: &str,
) -> Result<Vec<String>, AppError> {
    let endpoint = spot_symbols_endpoint(rest_base_url);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let payload = response.json::<BinanceExchangeInfoWire>().await?;

    let symbols = normalize_symbols(
        payload
            .symbols
            .into_iter()
            .filter(|entry| {
                entry.is_spot_trading_allowed && entry.status.eq_ignore_ascii_case("TRADING")
            })
            .map(|entry| entry.symbol),
    );
    if symbols.is_empty() {
        return Err(AppError::InvalidArgument(
            "exchangeInfo returned no trading spot symbols".to_string(),
        ));
    }

    Ok(symbols)
}

pub fn reconnect_delay(attempt: u32, jitter_seed: i64) -> Duration {
    let exponent = attempt.min(6);
    let base_ms = RECONNECT_BASE_DELAY_MS.saturating_mul(1_u64 << exponent);
    let jitter_ms = jitter_seed.unsigned_abs() % 250;
    Duration::from_millis((base_ms + jitter_ms).min(RECONNECT_MAX_DELAY_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spot_symbols_endpoint_requests_spot_permissions() {
        let endpoint = spot_symbols_endpoint("https://api.binance.com");
        assert_eq!(
            endpoint,
            "https://api.binance.com/api/v3/exchangeInfo?permissions=SPOT"
        );
    }

    #[test]
    fn reconnect_delay_grows_and_caps() {
        assert_eq!(reconnect_delay(0, 0), Duration::from_millis(200));
        assert_eq!(reconnect_delay(1, 0), Duration::from_millis(400));
        assert_eq!(reconnect_delay(3, 10), Duration::from_millis(1_610));
        assert_eq!(reconnect_delay(40, 249), Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn feed_command_is_sent_as_text_frame() {
        let mut sent: Vec<Message> = Vec::new();
        send_feed_command(&mut sent, &FeedCommand::subscribe("btcusdt", 9))
            .await
            .expect("vec sink never fails");

        assert_eq!(
            sent,
            vec![Message::Text(
                r#"{"method":"SUBSCRIBE","params":["btcusdt@trade"],"id":9}"#.to_string()
            )]
        );
    }
}
