use crate::alerts::persistence::now_unix_ms;
use crate::error::{AppError, ClientError};
use crate::session::handler::{SessionHandler, SessionReply};
use crate::state::SessionServerState;
use futures_util::{Sink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionFlow {
    Continue,
    Closed,
}

pub async fn run_session_server(
    state: SessionServerState,
    cancel_token: CancellationToken,
) -> Result<(), AppError> {
    let listener = TcpListener::bind(state.config.listen_addr).await?;
    serve(listener, state, cancel_token).await
}

/// Accepts client sessions until cancelled, then waits for every open session to close.
pub async fn serve(
    listener: TcpListener,
    state: SessionServerState,
    cancel_token: CancellationToken,
) -> Result<(), AppError> {
    info!(addr = %listener.local_addr()?, "session server listening");
    let state = Arc::new(state);
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    sessions.spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&state),
                        cancel_token.child_token(),
                    ));
                }
                Err(error) => warn!(%error, "failed to accept client connection"),
            },
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(error) = joined {
                    warn!(%error, "session task aborted");
                }
            }
        }
    }

    info!(open_sessions = sessions.len(), "session server stopping");
    while let Some(joined) = sessions.join_next().await {
        if let Err(error) = joined {
            warn!(%error, "session task aborted");
        }
    }
    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<SessionServerState>,
    cancel_token: CancellationToken,
) {
    let websocket = match accept_async(stream).await {
        Ok(websocket) => websocket,
        Err(error) => {
            warn!(%peer, %error, "websocket handshake failed");
            return;
        }
    };

    let mut handler = match SessionHandler::open(
        state.db_pool.clone(),
        Arc::clone(&state.supported_symbols),
        state.config.heartbeat_limit_ms(),
        now_unix_ms(),
    )
    .await
    {
        Ok(handler) => handler,
        Err(error) => {
            warn!(%peer, %error, "failed to register session");
            return;
        }
    };

    let span = info_span!("session", connection_id = %handler.connection_id(), %peer);
    run_session(
        &handler,
        websocket,
        state.config.client_receive_timeout,
        &cancel_token,
    )
    .instrument(span.clone())
    .await;

    if let Err(error) = handler.close(now_unix_ms()).instrument(span).await {
        warn!(%peer, %error, "failed to finish session");
    }
}

/// Alternates a bounded wait for client input with a delivery pass, so pending
/// notifications go out at least once per receive timeout.
async fn run_session(
    handler: &SessionHandler,
    websocket: WebSocketStream<TcpStream>,
    receive_timeout: Duration,
    cancel_token: &CancellationToken,
) {
    let (mut outbound, mut inbound) = websocket.split();

    loop {
        let received = tokio::select! {
            _ = cancel_token.cancelled() => {
                let _ = outbound.send(Message::Close(None)).await;
                break;
            }
            received = tokio::time::timeout(receive_timeout, inbound.next()) => received,
        };

        match received {
            Err(_elapsed) => {}
            Ok(Some(Ok(message))) => match handle_inbound(handler, &mut outbound, message).await {
                Ok(SessionFlow::Continue) => {}
                Ok(SessionFlow::Closed) => break,
                Err(error) => {
                    debug!(%error, "reply failed, closing session");
                    break;
                }
            },
            Ok(Some(Err(error))) => {
                debug!(%error, "client stream error");
                break;
            }
            Ok(None) => break,
        }

        match handler.deliver_pending(&mut outbound, now_unix_ms()).await {
            Ok(0) => {}
            Ok(delivered) => debug!(delivered, "notifications delivered"),
            Err(AppError::WebSocket(error)) => {
                debug!(%error, "push failed, closing session");
                break;
            }
            Err(error) => warn!(%error, "delivery pass failed"),
        }
    }

    let _ = outbound.close().await;
}

async fn handle_inbound<S>(
    handler: &SessionHandler,
    outbound: &mut S,
    message: Message,
) -> Result<SessionFlow, AppError>
where
    S: Sink<Message> + Unpin,
    AppError: From<S::Error>,
{
    let reply = match message {
        Message::Text(text_payload) => {
            let mut owned_payload = text_payload.into_bytes();
            handle_request(handler, owned_payload.as_mut_slice()).await
        }
        Message::Binary(mut binary_payload) => {
            handle_request(handler, binary_payload.as_mut_slice()).await
        }
        Message::Close(frame) => {
            debug!(?frame, "client sent close frame");
            return Ok(SessionFlow::Closed);
        }
        _ => return Ok(SessionFlow::Continue),
    };

    for frame in reply.frames()? {
        outbound.send(Message::Text(frame)).await?;
    }
    Ok(SessionFlow::Continue)
}

async fn handle_request(handler: &SessionHandler, payload: &mut [u8]) -> SessionReply {
    match handler.handle_client_payload(payload, now_unix_ms()).await {
        Ok(reply) => reply,
        Err(error) => {
            warn!(%error, "client request could not be stored");
            SessionReply::Rejected(ClientError::new(
                "request could not be processed, please retry",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::persistence::{enqueue_notifications, list_live_subscriptions_for_symbol};
    use crate::alerts::types::{NewNotification, Subscription};
    use crate::config::AlertsConfigArgs;
    use crate::db::initialize_memory_pool;
    use crate::session::symbols::SupportedSymbols;
    use tokio_tungstenite::connect_async;

    type ServerTask = tokio::task::JoinHandle<Result<(), AppError>>;

    async fn start_server() -> (SocketAddr, SessionServerState, CancellationToken, ServerTask) {
        let config = AlertsConfigArgs {
            listen_addr: Some("127.0.0.1:0".to_string()),
            client_receive_timeout_secs: Some(0.05),
            supported_symbols: Some(vec!["btcusdt".to_string()]),
            ..Default::default()
        }
        .normalize()
        .expect("config should normalize");
        let pool = initialize_memory_pool().await.expect("pool");
        let state = SessionServerState::new(
            pool,
            config.clone(),
            SupportedSymbols::new(["btcusdt"]),
        );

        let listener = TcpListener::bind(config.listen_addr).await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let cancel_token = CancellationToken::new();
        let server = tokio::spawn(serve(listener, state.clone(), cancel_token.clone()));
        (addr, state, cancel_token, server)
    }

    async fn next_text<S>(stream: &mut S) -> String
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .expect("server reply in time")
                .expect("stream open")
                .expect("frame");
            if let Message::Text(text) = message {
                return text;
            }
        }
    }

    #[tokio::test]
    async fn subscription_round_trip_and_notification_push() {
        let (addr, state, cancel_token, server) = start_server().await;
        let (mut client, _) = connect_async(format!("ws://{addr}"))
            .await
            .expect("client connects");

        client
            .send(Message::Text(r#"{"symbol":"xxxxxx","threshold":"1"}"#.to_string()))
            .await
            .expect("send");
        let rejection = next_text(&mut client).await;
        assert!(rejection.contains(r#""type":"error""#));

        client
            .send(Message::Text(r#"{"symbol":"BTCUSDT","threshold":"1000"}"#.to_string()))
            .await
            .expect("send");
        let mut echo = next_text(&mut client).await.into_bytes();
        let subscription: Subscription =
            simd_json::serde::from_slice(&mut echo).expect("subscription echo");
        assert_eq!(subscription.symbol, "btcusdt");

        enqueue_notifications(
            &state.db_pool,
            &[NewNotification::for_crossing(&subscription, 1100.0, 9)],
            now_unix_ms(),
        )
        .await
        .expect("enqueue");
        let pushed = next_text(&mut client).await;
        assert!(pushed.contains("Price has surpassed the threshold: 1100"));

        cancel_token.cancel();
        server.await.expect("join").expect("server result");

        let live = list_live_subscriptions_for_symbol(
            &state.db_pool,
            "btcusdt",
            now_unix_ms(),
            state.config.heartbeat_limit_ms(),
        )
        .await
        .expect("live subscriptions");
        assert!(live.is_empty());
    }

    #[tokio::test]
    async fn client_disconnect_releases_subscriptions() {
        let (addr, state, cancel_token, server) = start_server().await;
        let (mut client, _) = connect_async(format!("ws://{addr}"))
            .await
            .expect("client connects");
        client
            .send(Message::Text(r#"{"symbol":"btcusdt","threshold":"5"}"#.to_string()))
            .await
            .expect("send");
        next_text(&mut client).await;

        client.close(None).await.expect("close");
        drop(client);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let live = list_live_subscriptions_for_symbol(
                &state.db_pool,
                "btcusdt",
                now_unix_ms(),
                state.config.heartbeat_limit_ms(),
            )
            .await
            .expect("live subscriptions");
            if live.is_empty() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "session never closed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        cancel_token.cancel();
        server.await.expect("join").expect("server result");
    }
}
