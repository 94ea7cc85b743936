//! Async driver that connects the pure state machine to a real WebSocket.
//!
//! [`Subscriber::spawn`] starts a background task owning the socket, the
//! keepalive/backoff timers, and the machine. Decoded events flow out on an
//! mpsc channel; lifecycle status is published on a watch channel; the
//! handle can request a manual reconnect or a shutdown.

use std::collections::VecDeque;
use std::pin::Pin;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Sleep;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use agentdeck_protocol::{ClientMessage, Event};

use crate::backoff::jittered;
use crate::machine::{Effect, Input, Machine, State, SubscriberConfig, TerminalReason};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Full WebSocket URL, e.g. `ws://127.0.0.1:4400/api/events/ws`.
    pub url: String,
    pub username: String,
    pub password: String,
}

/// Externally visible subscriber status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connecting,
    Connected,
    Reconnecting,
    /// Stopped for good; reconnecting automatically would be wrong.
    Terminal(TerminalReason),
}

/// Commands the handle can send to the driver.
enum Command {
    Reconnect,
    Shutdown,
}

/// Handle to a running subscriber task.
pub struct Subscriber {
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<Status>,
}

impl Subscriber {
    /// Spawn the driver task. Returns the handle and the stream of decoded
    /// events. Dropping the event receiver shuts the subscriber down.
    pub fn spawn(config: SubscriberConfig, endpoint: Endpoint) -> (Self, mpsc::Receiver<Event>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(Status::Connecting);
        tokio::spawn(run(config, endpoint, cmd_rx, event_tx, status_tx));
        (Self { cmd_tx, status_rx }, event_rx)
    }

    /// Current lifecycle status.
    pub fn status(&self) -> Status {
        *self.status_rx.borrow()
    }

    /// Watch for status changes.
    pub fn status_watch(&self) -> watch::Receiver<Status> {
        self.status_rx.clone()
    }

    /// Ask for an immediate reconnect, resetting the backoff schedule.
    pub async fn reconnect(&self) {
        let _ = self.cmd_tx.send(Command::Reconnect).await;
    }

    /// Stop the subscriber, closing any open socket cleanly.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

struct Driver {
    endpoint: Endpoint,
    config: SubscriberConfig,
    machine: Machine,
    socket: Option<WsStream>,
    ping_timer: Option<Pin<Box<Sleep>>>,
    pong_timer: Option<Pin<Box<Sleep>>>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    event_tx: mpsc::Sender<Event>,
    status_tx: watch::Sender<Status>,
    rng: StdRng,
}

async fn run(
    config: SubscriberConfig,
    endpoint: Endpoint,
    mut cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<Event>,
    status_tx: watch::Sender<Status>,
) {
    let mut driver = Driver {
        endpoint,
        config: config.clone(),
        machine: Machine::new(config),
        socket: None,
        ping_timer: None,
        pong_timer: None,
        reconnect_timer: None,
        event_tx,
        status_tx,
        rng: StdRng::from_entropy(),
    };

    let mut pending: VecDeque<Input> = VecDeque::from([Input::Open]);
    loop {
        // Feed queued inputs through the machine before touching the
        // network again; effect handlers may queue follow-up inputs.
        while let Some(input) = pending.pop_front() {
            let effects = driver.machine.handle(input);
            for effect in effects {
                driver.perform(effect, &mut pending).await;
            }
            driver.publish_status();
        }
        if driver.machine.is_done() {
            break;
        }

        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Reconnect) => pending.push_back(Input::ManualReconnect),
                Some(Command::Shutdown) | None => pending.push_back(Input::Teardown),
            },
            () = maybe_sleep(&mut driver.reconnect_timer) => {
                driver.reconnect_timer = None;
                pending.push_back(Input::ReconnectDue);
            }
            () = maybe_sleep(&mut driver.ping_timer) => {
                driver.ping_timer = None;
                pending.push_back(Input::PingDue);
            }
            () = maybe_sleep(&mut driver.pong_timer) => {
                driver.pong_timer = None;
                pending.push_back(Input::PongTimedOut);
            }
            frame = next_frame(&mut driver.socket) => {
                if let Some(input) = driver.interpret_frame(frame) {
                    pending.push_back(input);
                }
            }
        }
    }
    info!("Subscriber stopped");
}

/// Awaits the timer when armed; pends forever otherwise, so it never wins
/// the select.
async fn maybe_sleep(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn next_frame(socket: &mut Option<WsStream>) -> Option<Result<Message, WsError>> {
    match socket {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn perform(&mut self, effect: Effect, pending: &mut VecDeque<Input>) {
        match effect {
            Effect::Connect => {
                let input = self.connect().await;
                pending.push_back(input);
            }
            Effect::SendPing => self.send_ping().await,
            Effect::StartPingTimer => {
                self.ping_timer = Some(Box::pin(tokio::time::sleep(self.config.ping_interval)));
            }
            Effect::ArmPongTimeout => {
                self.pong_timer = Some(Box::pin(tokio::time::sleep(self.config.pong_timeout)));
            }
            Effect::ClearPongTimeout => self.pong_timer = None,
            Effect::CancelTimers => {
                self.ping_timer = None;
                self.pong_timer = None;
                self.reconnect_timer = None;
            }
            Effect::CloseSocket { code } => self.close_socket(code).await,
            Effect::ScheduleReconnect(delay) => {
                let delay = jittered(delay, &mut self.rng);
                debug!(delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
                self.reconnect_timer = Some(Box::pin(tokio::time::sleep(delay)));
            }
            Effect::Deliver(event) => {
                if self.event_tx.send(event).await.is_err() {
                    // Consumer is gone; wind the subscriber down.
                    pending.push_back(Input::Teardown);
                }
            }
            Effect::NotifyTerminal(reason) => {
                let _ = self.status_tx.send(Status::Terminal(reason));
            }
        }
    }

    /// One connection attempt, mapped to the machine's vocabulary.
    async fn connect(&mut self) -> Input {
        let request = match self.build_request() {
            Ok(r) => r,
            Err(e) => {
                // A URL or credential string that cannot form a request will
                // never connect; retrying is pointless.
                warn!("Invalid endpoint configuration: {e}");
                return Input::AuthRejected;
            }
        };
        match tokio_tungstenite::connect_async(request).await {
            Ok((ws, _)) => {
                info!(url = %self.endpoint.url, "Connected");
                self.socket = Some(ws);
                Input::Opened
            }
            Err(WsError::Http(response))
                if matches!(
                    response.status(),
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                ) =>
            {
                warn!(status = %response.status(), "Connection rejected: authentication failed");
                Input::AuthRejected
            }
            Err(e) => {
                warn!("Connection attempt failed: {e}");
                Input::ConnectFailed
            }
        }
    }

    fn build_request(&self) -> Result<Request, String> {
        let mut request = self
            .endpoint
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| e.to_string())?;
        let token = base64::engine::general_purpose::STANDARD.encode(format!(
            "{}:{}",
            self.endpoint.username, self.endpoint.password
        ));
        let value =
            HeaderValue::from_str(&format!("Basic {token}")).map_err(|e| e.to_string())?;
        request.headers_mut().insert("Authorization", value);
        Ok(request)
    }

    async fn send_ping(&mut self) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        match serde_json::to_string(&ClientMessage::ping()) {
            Ok(text) => {
                // A send failure surfaces as a read error on the next frame.
                if let Err(e) = socket.send(Message::Text(text.into())).await {
                    debug!("Ping send failed: {e}");
                }
            }
            Err(e) => warn!("Failed to serialize ping: {e}"),
        }
    }

    async fn close_socket(&mut self, code: u16) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket
                .close(Some(CloseFrame {
                    code: code.into(),
                    reason: "client closing".into(),
                }))
                .await;
        }
    }

    /// Map a raw socket frame to a machine input, or `None` for frames the
    /// machine does not care about (protocol pings/pongs are handled by
    /// tungstenite during stream polling).
    fn interpret_frame(&mut self, frame: Option<Result<Message, WsError>>) -> Option<Input> {
        match frame {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<Event>(text.as_str()) {
                Ok(event) => Some(Input::Message(event)),
                Err(e) => {
                    warn!("Malformed event from server: {e}");
                    Some(Input::MalformedMessage)
                }
            },
            Some(Ok(
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_),
            )) => None,
            Some(Ok(Message::Close(frame))) => {
                let code = frame.map(|f| u16::from(f.code));
                info!(?code, "Server closed the connection");
                self.socket = None;
                Some(Input::SocketClosed { code })
            }
            Some(Err(e)) => {
                warn!("Socket error: {e}");
                self.socket = None;
                Some(Input::SocketClosed { code: None })
            }
            None => {
                self.socket = None;
                Some(Input::SocketClosed { code: None })
            }
        }
    }

    fn publish_status(&self) {
        let status = match self.machine.state() {
            State::Idle | State::Connecting => Status::Connecting,
            State::Connected => Status::Connected,
            State::Reconnecting => Status::Reconnecting,
            State::Closed => Status::Terminal(TerminalReason::Closed),
            State::Failed => return, // already published via NotifyTerminal
        };
        let _ = self.status_tx.send(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use agentdeck_server::config::{AuthConfig, Config};
    use agentdeck_server::{routes, AppState};

    async fn serve() -> (AppState, SocketAddr) {
        let mut config = Config::load(None);
        config.auth = AuthConfig {
            username: "deck".into(),
            password: "s3cret".into(),
            ..AuthConfig::default()
        };
        let state = AppState::new(config);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = routes::router(state.clone());
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        (state, addr)
    }

    fn endpoint(addr: SocketAddr, password: &str) -> Endpoint {
        Endpoint {
            url: format!("ws://{addr}/api/events/ws"),
            username: "deck".into(),
            password: password.into(),
        }
    }

    async fn wait_for_status(subscriber: &Subscriber, want: Status) {
        let mut watch = subscriber.status_watch();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if *watch.borrow_and_update() == want {
                    return;
                }
                watch.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"));
    }

    #[tokio::test]
    async fn receives_hello_then_broadcasts() {
        let (state, addr) = serve().await;
        let (subscriber, mut events) =
            Subscriber::spawn(SubscriberConfig::default(), endpoint(addr, "s3cret"));

        let hello = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hello.kind(), "auth.success");
        assert_eq!(subscriber.status(), Status::Connected);

        state
            .broadcaster
            .agent_status("a1", agentdeck_protocol::AgentState::Idle, 0, None)
            .await;
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind(), "agent.status");

        subscriber.shutdown().await;
    }

    #[tokio::test]
    async fn bad_credentials_are_terminal() {
        let (_state, addr) = serve().await;
        let (subscriber, _events) =
            Subscriber::spawn(SubscriberConfig::default(), endpoint(addr, "wrong"));
        wait_for_status(&subscriber, Status::Terminal(TerminalReason::AuthRejected)).await;
    }

    #[tokio::test]
    async fn server_shutdown_triggers_reconnect_not_terminal() {
        let (state, addr) = serve().await;
        let (subscriber, mut events) =
            Subscriber::spawn(SubscriberConfig::default(), endpoint(addr, "s3cret"));
        events.recv().await.unwrap(); // auth.success

        // Server closes every socket with the restart code.
        state.registry.close_all().await;

        wait_for_status(&subscriber, Status::Reconnecting).await;
        subscriber.shutdown().await;
    }
}
