//! The process-wide set of admitted event WebSocket connections.
//!
//! One [`ConnectionRegistry`] instance owns every live connection. All
//! mutations (add/remove/broadcast/sweep) go through a single mutex around
//! the inner state, so broadcast never observes a connection mid-teardown.
//! The registry is explicitly constructed and injected at the composition
//! root; tests build as many independent registries as they like.
//!
//! Delivery is best-effort and fire-and-forget: `broadcast` serializes the
//! event once, offers it to every live connection, and prunes connections
//! whose outbound channel has closed. A partial failure never rolls back or
//! retries — the failing connection is simply dropped from future
//! broadcasts.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
// tokio's Instant so paused-clock tests can drive the heartbeat sweep.
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use agentdeck_protocol::{close, Event};

/// A frame queued for a connection's socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// A serialized event envelope, sent as a text message.
    Event(String),
    /// A protocol-level WebSocket ping (heartbeat).
    Ping(Vec<u8>),
    /// Graceful close with a close frame.
    Close { code: u16, reason: &'static str },
    /// Immediate termination without a close handshake. Used for half-open
    /// connections that would never answer a graceful close.
    Terminate,
}

/// One admitted connection. Created by the WebSocket handler after the auth
/// gate accepts the upgrade; owned exclusively by the registry afterwards.
pub struct Connection {
    pub id: Uuid,
    /// Remote address used for rate-limit and capacity bucketing;
    /// `"unknown"` when unavailable.
    pub remote_addr: String,
    /// Identity established at auth time; immutable for the connection's
    /// lifetime.
    pub user_id: String,
    pub connected_at: Instant,
    /// Last time this connection answered a heartbeat ping.
    last_pong: Instant,
    tx: mpsc::Sender<OutboundFrame>,
}

impl Connection {
    pub fn new(remote_addr: String, user_id: String, tx: mpsc::Sender<OutboundFrame>) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            user_id,
            connected_at: now,
            last_pong: now,
            tx,
        }
    }

    /// Queue a frame without blocking. `Err` means the socket task is gone
    /// (channel closed) or hopelessly backed up (channel full).
    fn try_send(&self, frame: OutboundFrame) -> Result<(), mpsc::error::TrySendError<OutboundFrame>> {
        self.tx.try_send(frame)
    }
}

/// Why [`ConnectionRegistry::can_accept`] refused a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityError {
    /// The global connection cap is reached.
    Global,
    /// The per-address cap for this remote address is reached.
    PerAddress,
}

impl fmt::Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "too many connections"),
            Self::PerAddress => write!(f, "too many connections from this address"),
        }
    }
}

/// Connection caps enforced pre-admission.
#[derive(Debug, Clone, Copy)]
pub struct RegistryLimits {
    pub max_connections: usize,
    pub max_per_address: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_per_address: 5,
        }
    }
}

struct Inner {
    connections: HashMap<Uuid, Connection>,
    /// Live-connection count per remote address. Kept consistent with
    /// `connections`: incremented on add, decremented on remove, entry
    /// deleted at zero.
    per_address: HashMap<String, usize>,
}

/// The single set of live connections plus per-address bookkeeping.
pub struct ConnectionRegistry {
    limits: RegistryLimits,
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            limits,
            inner: Mutex::new(Inner {
                connections: HashMap::new(),
                per_address: HashMap::new(),
            }),
        }
    }

    /// Pre-admission capacity check. Called by the auth gate *before* the
    /// upgrade completes and the connection object exists.
    pub async fn can_accept(&self, remote_addr: &str) -> Result<(), CapacityError> {
        let inner = self.inner.lock().await;
        if inner.connections.len() >= self.limits.max_connections {
            return Err(CapacityError::Global);
        }
        let per_addr = inner.per_address.get(remote_addr).copied().unwrap_or(0);
        if per_addr >= self.limits.max_per_address {
            return Err(CapacityError::PerAddress);
        }
        Ok(())
    }

    /// Insert a connection into the live set and bump its address counter.
    pub async fn add(&self, conn: Connection) {
        let mut inner = self.inner.lock().await;
        *inner.per_address.entry(conn.remote_addr.clone()).or_insert(0) += 1;
        debug!(id = %conn.id, addr = %conn.remote_addr, user = %conn.user_id, "Connection registered");
        inner.connections.insert(conn.id, conn);
    }

    /// Remove a connection. Idempotent: removing an id that is no longer in
    /// the set is a no-op. Returns whether a connection was removed.
    pub async fn remove(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        remove_locked(&mut inner, id)
    }

    /// Serialize `event` once and offer it to every live connection.
    ///
    /// Connections whose outbound channel has closed are pruned in the same
    /// locked pass. Returns the number of connections the event was queued
    /// for. Never fails from the producer's point of view.
    pub async fn broadcast(&self, event: &Event) -> usize {
        let text = match serde_json::to_string(event) {
            Ok(t) => t,
            Err(e) => {
                warn!(kind = event.kind(), "Failed to serialize event: {e}");
                return 0;
            }
        };

        let mut inner = self.inner.lock().await;
        let mut dead: Vec<Uuid> = Vec::new();
        let mut delivered = 0usize;
        for conn in inner.connections.values() {
            match conn.try_send(OutboundFrame::Event(text.clone())) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(conn.id),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow consumer: drop this one message rather than the
                    // connection. The heartbeat will evict it if it is
                    // actually gone.
                    warn!(id = %conn.id, kind = event.kind(), "Dropped event (client backpressure)");
                }
            }
        }
        for id in dead {
            remove_locked(&mut inner, id);
            debug!(%id, "Pruned dead connection during broadcast");
        }
        delivered
    }

    /// Send `pong` bookkeeping: record that a connection answered a
    /// heartbeat ping.
    pub async fn record_pong(&self, id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(conn) = inner.connections.get_mut(&id) {
            conn.last_pong = Instant::now();
        }
    }

    /// Heartbeat sweep: terminate connections that have not answered a ping
    /// within `timeout` (hard termination — a half-open socket won't answer
    /// a graceful close either), and send a protocol ping to the rest.
    /// Returns the ids of terminated connections.
    pub async fn sweep_stale(&self, timeout: Duration) -> Vec<Uuid> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let mut stale: Vec<Uuid> = Vec::new();

        for conn in inner.connections.values() {
            if now.duration_since(conn.last_pong) > timeout {
                // Best-effort: the socket task may already be gone.
                let _ = conn.try_send(OutboundFrame::Terminate);
                stale.push(conn.id);
            } else if conn.try_send(OutboundFrame::Ping(Vec::new())).is_err() {
                stale.push(conn.id);
            }
        }
        for id in &stale {
            remove_locked(&mut inner, *id);
            warn!(id = %id, "Terminated connection (heartbeat timeout)");
        }
        stale
    }

    /// Close every connection with the server-shutdown code and clear the
    /// set. Sockets that are already closing are tolerated (their channel
    /// send simply fails).
    pub async fn close_all(&self) {
        let mut inner = self.inner.lock().await;
        for conn in inner.connections.values() {
            let _ = conn.try_send(OutboundFrame::Close {
                code: close::SERVER_SHUTDOWN,
                reason: "server shutting down",
            });
        }
        inner.connections.clear();
        inner.per_address.clear();
    }

    /// Number of live connections.
    pub async fn count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    /// Snapshot of per-address connection counts.
    pub async fn address_counts(&self) -> HashMap<String, usize> {
        self.inner.lock().await.per_address.clone()
    }
}

/// Remove under an already-held lock, keeping both maps consistent.
fn remove_locked(inner: &mut Inner, id: Uuid) -> bool {
    let Some(conn) = inner.connections.remove(&id) else {
        return false;
    };
    if let Some(count) = inner.per_address.get_mut(&conn.remote_addr) {
        *count -= 1;
        if *count == 0 {
            inner.per_address.remove(&conn.remote_addr);
        }
    }
    true
}
