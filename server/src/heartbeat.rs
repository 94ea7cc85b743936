//! Periodic liveness sweep over the connection registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::HeartbeatConfig;
use crate::registry::ConnectionRegistry;

/// Spawn the heartbeat task: every `interval_secs` it pings fresh
/// connections and terminates any that have gone `timeout_secs` without a
/// pong. Runs until the process exits.
pub fn spawn(registry: Arc<ConnectionRegistry>, config: HeartbeatConfig) -> JoinHandle<()> {
    let interval = Duration::from_secs(config.interval_secs);
    let timeout = Duration::from_secs(config.timeout_secs);
    info!(
        interval_secs = config.interval_secs,
        timeout_secs = config.timeout_secs,
        "Heartbeat monitor started"
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; skip it so a connection admitted at
        // startup is not pinged before it finishes its handshake.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let terminated = registry.sweep_stale(timeout).await;
            if !terminated.is_empty() {
                debug!(count = terminated.len(), "Heartbeat sweep evicted connections");
            }
        }
    })
}
