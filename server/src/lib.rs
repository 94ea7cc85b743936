#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! agentdeck server library — the event distribution layer behind the
//! agent-orchestration dashboard.
//!
//! Building blocks:
//! - `auth` — Basic-Auth gate with rate limiting and origin checks
//! - `broadcast` — typed event producers
//! - `config` — TOML + env-var configuration
//! - `heartbeat` — periodic liveness sweep
//! - `registry` — the live connection set
//! - `routes` — REST route handlers (health, stats)
//! - `ws` — WebSocket upgrade and per-connection socket task

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod heartbeat;
pub mod registry;
pub mod routes;
pub mod state;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use auth::AuthGate;
pub use broadcast::Broadcaster;
pub use config::Config;
pub use registry::ConnectionRegistry;
pub use state::AppState;
