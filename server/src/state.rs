//! Shared application state, built once in `main` and injected everywhere.
//!
//! Nothing here is a process-global: tests compose their own state with
//! their own registry and gate.

use std::sync::Arc;
use std::time::Instant;

use crate::auth::AuthGate;
use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::registry::{ConnectionRegistry, RegistryLimits};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ConnectionRegistry>,
    pub broadcaster: Broadcaster,
    pub auth_gate: Arc<AuthGate>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(RegistryLimits {
            max_connections: config.server.max_connections,
            max_per_address: config.server.max_per_address,
        }));
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let auth_gate = Arc::new(AuthGate::new(config.auth.clone()));
        Self {
            config: Arc::new(config),
            registry,
            broadcaster,
            auth_gate,
            started_at: Instant::now(),
        }
    }

    /// Seconds since this server instance started.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
