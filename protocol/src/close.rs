//! WebSocket close codes used by the event layer.
//!
//! The server closes with [`SERVER_SHUTDOWN`] on graceful stop and with
//! [`POLICY_VIOLATION`] when a connection is rejected for auth reasons. A
//! client seeing [`POLICY_VIOLATION`] must not reconnect automatically —
//! retrying with the same credentials cannot succeed.

/// Normal closure: the client disconnected intentionally (UI unmount).
pub const NORMAL: u16 = 1000;

/// The endpoint is going away (browser navigation, tab close).
pub const GOING_AWAY: u16 = 1001;

/// Auth rejection. Terminal for the client; never retried.
pub const POLICY_VIOLATION: u16 = 1008;

/// The server is shutting down or restarting. Clients may reconnect.
pub const SERVER_SHUTDOWN: u16 = 1012;

/// Whether a close code indicates an intentional, clean shutdown that the
/// client should not recover from automatically.
pub fn is_clean(code: u16) -> bool {
    code == NORMAL || code == GOING_AWAY
}

/// Whether a close code signals an auth rejection (terminal).
pub fn is_auth_rejection(code: u16) -> bool {
    code == POLICY_VIOLATION
}
