//! Typed event producers.
//!
//! Internal subsystems never build JSON by hand; they call a method here,
//! the broadcaster stamps the timestamp and hands the event to the registry.
//! Delivery is fire-and-forget, so producers never block on slow clients.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use agentdeck_protocol::{AgentState, Event, EventPayload, GatewayState, SessionKind};

use crate::registry::ConnectionRegistry;

/// Cheap to clone; all clones share the one registry.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub async fn session_created(
        &self,
        session_key: &str,
        agent_id: &str,
        kind: SessionKind,
        label: Option<String>,
    ) {
        self.emit(EventPayload::SessionCreated {
            session_key: session_key.to_string(),
            agent_id: agent_id.to_string(),
            kind,
            label,
        })
        .await;
    }

    pub async fn session_killed(&self, session_key: &str, agent_id: Option<String>) {
        self.emit(EventPayload::SessionKilled {
            session_key: session_key.to_string(),
            agent_id,
        })
        .await;
    }

    pub async fn agent_status(
        &self,
        agent_id: &str,
        status: AgentState,
        active_session_count: u32,
        last_activity: Option<DateTime<Utc>>,
    ) {
        self.emit(EventPayload::AgentStatus {
            agent_id: agent_id.to_string(),
            status,
            active_session_count,
            last_activity,
        })
        .await;
    }

    pub async fn cron_executed(
        &self,
        job_id: &str,
        command: &str,
        exit_code: i32,
        stdout: Option<String>,
        stderr: Option<String>,
        duration_ms: u64,
    ) {
        self.emit(EventPayload::CronExecuted {
            job_id: job_id.to_string(),
            command: command.to_string(),
            exit_code,
            stdout,
            stderr,
            duration_ms,
        })
        .await;
    }

    pub async fn gateway_status(&self, status: GatewayState, uptime_secs: u64) {
        self.emit(EventPayload::GatewayStatus {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime: uptime_secs,
        })
        .await;
    }

    async fn emit(&self, payload: EventPayload) {
        let event = Event::now(payload);
        let delivered = self.registry.broadcast(&event).await;
        debug!(kind = event.kind(), delivered, "Broadcast event");
    }
}
