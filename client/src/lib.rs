#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

//! Reconnecting subscriber for the agentdeck event WebSocket.
//!
//! - `backoff` — exponential reconnect delays with jitter
//! - `machine` — the connection lifecycle as a pure state machine
//! - `subscriber` — the async driver owning the socket and timers

pub mod backoff;
pub mod machine;
pub mod subscriber;

pub use machine::{SubscriberConfig, TerminalReason};
pub use subscriber::{Endpoint, Status, Subscriber};
