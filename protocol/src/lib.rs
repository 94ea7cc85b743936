//! Wire types shared by the agentdeck server and client.
//!
//! Every message on the event WebSocket is a JSON envelope:
//!
//! ```json
//! { "type": "<tag>", "timestamp": "<ISO-8601>", "payload": { ... } }
//! ```
//!
//! Server → client envelopes are [`Event`]; the payload is a closed tagged
//! union ([`EventPayload`]), so producers and consumers get exhaustive-match
//! safety instead of poking at untyped JSON. Client → server envelopes are
//! [`ClientMessage`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod close;

/// A server → client event. Immutable once constructed; the timestamp is
/// stamped by the producer at broadcast time, never by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Build an event stamped with the current time.
    pub fn now(payload: EventPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
        }
    }

    /// The wire tag for this event (`"agent.status"`, `"pong"`, ...).
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

/// The closed set of event payloads, adjacently tagged on the wire as
/// `{"type": ..., "payload": ...}`.
///
/// Payloads must never carry secrets (passwords, tokens).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventPayload {
    #[serde(rename = "session.created", rename_all = "camelCase")]
    SessionCreated {
        session_key: String,
        agent_id: String,
        kind: SessionKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    #[serde(rename = "session.killed", rename_all = "camelCase")]
    SessionKilled {
        session_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },
    #[serde(rename = "agent.status", rename_all = "camelCase")]
    AgentStatus {
        agent_id: String,
        status: AgentState,
        active_session_count: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_activity: Option<DateTime<Utc>>,
    },
    #[serde(rename = "cron.executed", rename_all = "camelCase")]
    CronExecuted {
        job_id: String,
        command: String,
        exit_code: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stdout: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
        duration_ms: u64,
    },
    #[serde(rename = "gateway.status", rename_all = "camelCase")]
    GatewayStatus {
        status: GatewayState,
        version: String,
        /// Seconds since the gateway started.
        uptime: u64,
    },
    /// Liveness probe. The payload echoes the originating timestamp when
    /// one is known.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    /// Reply to a client `ping`; carries the ping's timestamp so the client
    /// can measure round-trip time.
    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    #[serde(rename = "auth.success", rename_all = "camelCase")]
    AuthSuccess { user_id: String },
    #[serde(rename = "auth.failed")]
    AuthFailed { reason: String },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session.created",
            Self::SessionKilled { .. } => "session.killed",
            Self::AgentStatus { .. } => "agent.status",
            Self::CronExecuted { .. } => "cron.executed",
            Self::GatewayStatus { .. } => "gateway.status",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
            Self::AuthSuccess { .. } => "auth.success",
            Self::AuthFailed { .. } => "auth.failed",
        }
    }
}

/// How a session was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Direct,
    Cron,
    Subagent,
}

/// Agent lifecycle state as shown on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Running,
    Idle,
    Error,
}

/// Gateway process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayState {
    Running,
    Stopped,
    Error,
}

/// A client → server message.
///
/// The server answers `ping` with a [`EventPayload::Pong`] echoing the
/// ping's timestamp; `ack` and `subscribe` are accepted and logged but have
/// no broadcast-affecting behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: ClientMessageKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ClientMessage {
    /// A keepalive ping stamped with the current time.
    pub fn ping() -> Self {
        Self {
            kind: ClientMessageKind::Ping,
            timestamp: Utc::now(),
            payload: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientMessageKind {
    Ping,
    Ack,
    Subscribe,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn agent_status_wire_shape() {
        let event = Event {
            payload: EventPayload::AgentStatus {
                agent_id: "a1".into(),
                status: AgentState::Running,
                active_session_count: 1,
                last_activity: None,
            },
            timestamp: "2026-08-25T12:00:00Z".parse().unwrap(),
        };
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(
            wire,
            json!({
                "type": "agent.status",
                "timestamp": "2026-08-25T12:00:00Z",
                "payload": {"agentId": "a1", "status": "running", "activeSessionCount": 1},
            })
        );
    }

    #[test]
    fn session_created_roundtrip_with_optional_label() {
        let text = r#"{
            "type": "session.created",
            "timestamp": "2026-08-25T12:00:00Z",
            "payload": {"sessionKey": "s-1", "agentId": "a1", "kind": "cron"}
        }"#;
        let event: Event = serde_json::from_str(text).unwrap();
        match &event.payload {
            EventPayload::SessionCreated {
                session_key,
                kind,
                label,
                ..
            } => {
                assert_eq!(session_key, "s-1");
                assert_eq!(*kind, SessionKind::Cron);
                assert!(label.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn pong_echoes_timestamp() {
        let ts: DateTime<Utc> = "2026-08-25T09:30:00Z".parse().unwrap();
        let event = Event::now(EventPayload::Pong {
            timestamp: Some(ts),
        });
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "pong");
        assert_eq!(wire["payload"]["timestamp"], "2026-08-25T09:30:00Z");
    }

    #[test]
    fn client_message_without_payload_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "ping", "timestamp": "2026-08-25T12:00:00Z"}"#)
                .unwrap();
        assert_eq!(msg.kind, ClientMessageKind::Ping);
        assert!(msg.payload.is_none());
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let text = r#"{"type": "definitely.not.real", "timestamp": "2026-08-25T12:00:00Z", "payload": {}}"#;
        assert!(serde_json::from_str::<Event>(text).is_err());
    }
}
