//! The `GET /api/events/ws` upgrade handler and per-connection socket task.
//!
//! Authentication happens *before* the upgrade completes: a rejected request
//! gets a plain HTTP status and no WebSocket is ever established, so an
//! unauthenticated peer cannot hold a socket open. Credentials travel in the
//! `Authorization` header only.
//!
//! After the upgrade, each connection runs a single task that multiplexes
//! frames queued by the registry (events, heartbeat pings, closes) with
//! frames arriving from the client. Keeping both directions in one loop
//! means a `Terminate` queued by the heartbeat breaks the loop immediately
//! even if the peer has gone silent.

use std::net::SocketAddr;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use agentdeck_protocol::{Event, EventPayload};

use crate::registry::{Connection, ConnectionRegistry, OutboundFrame};
use crate::state::AppState;

/// Per-connection outbound queue depth. Small on purpose: a consumer that
/// falls this far behind starts losing events rather than buffering
/// unboundedly.
const OUTBOUND_QUEUE: usize = 64;

pub async fn events_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let remote_addr = remote.ip().to_string();
    let origin = headers.get("origin").and_then(|v| v.to_str().ok());
    let authorization = headers.get("authorization").and_then(|v| v.to_str().ok());

    let user_id = match state
        .auth_gate
        .check(&state.registry, &remote_addr, origin, authorization)
        .await
    {
        Ok(user_id) => user_id,
        Err(rejection) => {
            // The attempted credentials are never logged.
            warn!(addr = %remote_addr, reason = rejection.reason(), "Rejected WebSocket upgrade");
            return (rejection.status(), rejection.reason()).into_response();
        }
    };

    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, registry, remote_addr, user_id))
}

async fn handle_socket(
    mut socket: WebSocket,
    registry: std::sync::Arc<ConnectionRegistry>,
    remote_addr: String,
    user_id: String,
) {
    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_QUEUE);
    let conn = Connection::new(remote_addr.clone(), user_id.clone(), tx.clone());
    let id = conn.id;
    registry.add(conn).await;
    info!(%id, addr = %remote_addr, user = %user_id, "WebSocket connected");

    // First frame on every accepted connection.
    let hello = Event::now(EventPayload::AuthSuccess {
        user_id: user_id.clone(),
    });
    if send_event(&mut socket, &hello).await.is_err() {
        registry.remove(id).await;
        return;
    }

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(OutboundFrame::Event(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(OutboundFrame::Ping(data)) => {
                    if socket.send(Message::Ping(data.into())).await.is_err() {
                        break;
                    }
                }
                Some(OutboundFrame::Close { code, reason }) => {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                // Hard termination: no close handshake, just drop.
                Some(OutboundFrame::Terminate) | None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_client_text(&tx, id, text.as_str());
                }
                Some(Ok(Message::Pong(_))) => {
                    registry.record_pong(id).await;
                }
                // tungstenite answers protocol pings on our behalf.
                Some(Ok(Message::Ping(_) | Message::Binary(_))) => {}
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            },
        }
    }

    registry.remove(id).await;
    info!(%id, addr = %remote_addr, "WebSocket disconnected");
}

/// Handle one inbound text frame. Replies go through the connection's own
/// outbound queue (`try_send`, never awaited) so a backed-up socket cannot
/// deadlock the receive side.
fn handle_client_text(tx: &mpsc::Sender<OutboundFrame>, id: Uuid, text: &str) {
    match serde_json::from_str::<agentdeck_protocol::ClientMessage>(text) {
        Ok(msg) => {
            use agentdeck_protocol::ClientMessageKind;
            match msg.kind {
                ClientMessageKind::Ping => {
                    // Echo the client's timestamp so it can measure RTT.
                    let pong = Event::now(EventPayload::Pong {
                        timestamp: Some(msg.timestamp),
                    });
                    queue_event(tx, id, &pong);
                }
                ClientMessageKind::Ack | ClientMessageKind::Subscribe => {
                    debug!(%id, kind = ?msg.kind, "Client message acknowledged");
                }
            }
        }
        Err(e) => {
            warn!(%id, "Malformed client message: {e}");
            let error = Event::now(EventPayload::Error {
                message: "malformed message".to_string(),
                code: Some("bad_message".to_string()),
            });
            queue_event(tx, id, &error);
        }
    }
}

fn queue_event(tx: &mpsc::Sender<OutboundFrame>, id: Uuid, event: &Event) {
    match serde_json::to_string(event) {
        Ok(text) => {
            if tx.try_send(OutboundFrame::Event(text)).is_err() {
                warn!(%id, kind = event.kind(), "Dropped reply (client backpressure)");
            }
        }
        Err(e) => warn!(%id, "Failed to serialize reply: {e}"),
    }
}

async fn send_event(socket: &mut WebSocket, event: &Event) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).map_err(axum::Error::new)?;
    socket.send(Message::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, Config};
    use crate::state::AppState;
    use base64::Engine;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::StatusCode;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message as TgMessage};

    fn test_state() -> AppState {
        let mut config = Config::load(None);
        config.auth = AuthConfig {
            username: "deck".into(),
            password: "s3cret".into(),
            allowed_origins: vec!["https://deck.example.com".into()],
            ..AuthConfig::default()
        };
        AppState::new(config)
    }

    async fn serve(state: AppState) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = crate::routes::router(state);
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        addr
    }

    fn auth_header(user: &str, pass: &str) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        format!("Basic {encoded}")
    }

    fn ws_request(
        addr: SocketAddr,
        auth: Option<&str>,
        origin: Option<&str>,
    ) -> tokio_tungstenite::tungstenite::handshake::client::Request {
        let mut request = format!("ws://{addr}/api/events/ws")
            .into_client_request()
            .unwrap();
        if let Some(auth) = auth {
            request
                .headers_mut()
                .insert("Authorization", auth.parse().unwrap());
        }
        if let Some(origin) = origin {
            request.headers_mut().insert("Origin", origin.parse().unwrap());
        }
        request
    }

    async fn next_event(
        stream: &mut (impl StreamExt<Item = Result<TgMessage, WsError>> + Unpin),
    ) -> Event {
        loop {
            match stream.next().await.unwrap().unwrap() {
                TgMessage::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                TgMessage::Ping(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn authenticated_client_gets_hello_then_broadcasts() {
        let state = test_state();
        let broadcaster = state.broadcaster.clone();
        let addr = serve(state).await;

        let auth = auth_header("deck", "s3cret");
        let (mut ws, _) = tokio_tungstenite::connect_async(ws_request(addr, Some(&auth), None))
            .await
            .unwrap();

        let hello = next_event(&mut ws).await;
        match hello.payload {
            EventPayload::AuthSuccess { user_id } => assert_eq!(user_id, "deck"),
            other => panic!("expected auth.success, got {other:?}"),
        }

        broadcaster
            .agent_status("a1", agentdeck_protocol::AgentState::Idle, 0, None)
            .await;
        let event = next_event(&mut ws).await;
        assert_eq!(event.kind(), "agent.status");
    }

    #[tokio::test]
    async fn bad_credentials_rejected_before_upgrade() {
        let addr = serve(test_state()).await;
        let auth = auth_header("deck", "wrong");
        let err = tokio_tungstenite::connect_async(ws_request(addr, Some(&auth), None))
            .await
            .unwrap_err();
        match err {
            WsError::Http(response) => assert_eq!(response.status(), StatusCode::FORBIDDEN),
            other => panic!("expected HTTP rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_credentials_rejected_with_401() {
        let addr = serve(test_state()).await;
        let err = tokio_tungstenite::connect_async(ws_request(addr, None, None))
            .await
            .unwrap_err();
        match err {
            WsError::Http(response) => assert_eq!(response.status(), StatusCode::UNAUTHORIZED),
            other => panic!("expected HTTP rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disallowed_origin_rejected() {
        let addr = serve(test_state()).await;
        let auth = auth_header("deck", "s3cret");
        let err = tokio_tungstenite::connect_async(ws_request(
            addr,
            Some(&auth),
            Some("https://evil.example.com"),
        ))
        .await
        .unwrap_err();
        match err {
            WsError::Http(response) => assert_eq!(response.status(), StatusCode::FORBIDDEN),
            other => panic!("expected HTTP rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeated_failures_rate_limit_the_address() {
        let addr = serve(test_state()).await;
        let wrong = auth_header("deck", "wrong");
        for _ in 0..5 {
            let _ = tokio_tungstenite::connect_async(ws_request(addr, Some(&wrong), None)).await;
        }
        // Correct credentials no longer help from this address.
        let right = auth_header("deck", "s3cret");
        let err = tokio_tungstenite::connect_async(ws_request(addr, Some(&right), None))
            .await
            .unwrap_err();
        match err {
            WsError::Http(response) => {
                assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
            }
            other => panic!("expected HTTP rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn json_ping_answered_with_pong_to_sender_only() {
        let state = test_state();
        let addr = serve(state).await;
        let auth = auth_header("deck", "s3cret");

        let (mut ws_a, _) = tokio_tungstenite::connect_async(ws_request(addr, Some(&auth), None))
            .await
            .unwrap();
        let (mut ws_b, _) = tokio_tungstenite::connect_async(ws_request(addr, Some(&auth), None))
            .await
            .unwrap();
        next_event(&mut ws_a).await; // auth.success
        next_event(&mut ws_b).await;

        let ping = serde_json::to_string(&agentdeck_protocol::ClientMessage::ping()).unwrap();
        ws_a.send(TgMessage::Text(ping.into())).await.unwrap();

        let pong = next_event(&mut ws_a).await;
        assert_eq!(pong.kind(), "pong");
        match pong.payload {
            EventPayload::Pong { timestamp } => assert!(timestamp.is_some()),
            other => panic!("expected pong, got {other:?}"),
        }

        // The other client sees nothing.
        let quiet = tokio::time::timeout(std::time::Duration::from_millis(200), ws_b.next()).await;
        assert!(quiet.is_err(), "pong must not be broadcast");
    }

    #[tokio::test]
    async fn malformed_message_draws_error_event_not_disconnect() {
        let addr = serve(test_state()).await;
        let auth = auth_header("deck", "s3cret");
        let (mut ws, _) = tokio_tungstenite::connect_async(ws_request(addr, Some(&auth), None))
            .await
            .unwrap();
        next_event(&mut ws).await; // auth.success

        ws.send(TgMessage::Text("{not json".into())).await.unwrap();
        let event = next_event(&mut ws).await;
        match event.payload {
            EventPayload::Error { message, code } => {
                assert_eq!(message, "malformed message");
                assert_eq!(code.as_deref(), Some("bad_message"));
            }
            other => panic!("expected error event, got {other:?}"),
        }

        // Connection stays usable.
        let ping = serde_json::to_string(&agentdeck_protocol::ClientMessage::ping()).unwrap();
        ws.send(TgMessage::Text(ping.into())).await.unwrap();
        assert_eq!(next_event(&mut ws).await.kind(), "pong");
    }
}
