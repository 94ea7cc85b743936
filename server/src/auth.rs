//! Authentication gate for the event WebSocket.
//!
//! Every upgrade request passes through [`AuthGate::check`] before a socket
//! is admitted. Checks run in a fixed order, short-circuiting on the first
//! failure:
//!
//! 1. Failed-attempt rate limit (per remote address)
//! 2. `Origin` allow-list
//! 3. Registry capacity (pre-admission)
//! 4. `Authorization: Basic` extraction + username pattern
//! 5. Constant-time credential comparison
//!
//! The gate never panics and never logs the attempted password. Credentials
//! are accepted from the `Authorization` header only — query-string tokens
//! leak into access logs and are not supported.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use base64::Engine;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::AuthConfig;
use crate::registry::{CapacityError, ConnectionRegistry};

/// Why an upgrade request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    /// Too many failed attempts from this address within the window.
    RateLimited,
    /// `Origin` header present but not in the allow-list.
    OriginForbidden,
    /// Registry capacity reached (global or per-address).
    OverCapacity(CapacityError),
    /// `Authorization` header missing, malformed, or username fails the
    /// allow-listed character pattern.
    MalformedCredentials,
    /// Credentials present but wrong, or server credentials unconfigured.
    BadCredentials,
}

impl AuthRejection {
    pub fn status(self) -> StatusCode {
        match self {
            Self::RateLimited | Self::OverCapacity(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::MalformedCredentials => StatusCode::UNAUTHORIZED,
            Self::OriginForbidden | Self::BadCredentials => StatusCode::FORBIDDEN,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::RateLimited => "too many requests",
            Self::OriginForbidden => "origin not allowed",
            Self::OverCapacity(CapacityError::Global) => "too many connections",
            Self::OverCapacity(CapacityError::PerAddress) => {
                "too many connections from this address"
            }
            Self::MalformedCredentials => "missing or malformed credentials",
            Self::BadCredentials => "invalid credentials",
        }
    }
}

/// One address's failure history.
struct FailureWindow {
    count: u32,
    window_start: Instant,
}

/// Failed-auth bookkeeping per remote address.
///
/// Expired windows are swept on every check, and the map is capped: under
/// sustained attack traffic from many distinct addresses the oldest window
/// is evicted rather than letting the map grow without bound.
pub struct FailedAuthTracker {
    window: Duration,
    max_entries: usize,
    entries: HashMap<String, FailureWindow>,
}

impl FailedAuthTracker {
    pub fn new(window: Duration, max_entries: usize) -> Self {
        Self {
            window,
            max_entries,
            entries: HashMap::new(),
        }
    }

    fn sweep(&mut self, now: Instant) {
        let window = self.window;
        self.entries
            .retain(|_, w| now.duration_since(w.window_start) <= window);
    }

    /// Whether `addr` has reached `threshold` failures within the window.
    pub fn is_limited(&mut self, addr: &str, threshold: u32, now: Instant) -> bool {
        self.sweep(now);
        self.entries
            .get(addr)
            .is_some_and(|w| w.count >= threshold)
    }

    /// Record one failed attempt. Resets the window if it has elapsed.
    pub fn record_failure(&mut self, addr: &str, now: Instant) {
        self.sweep(now);
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(addr) {
            // Evict the oldest window to stay bounded.
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, w)| w.window_start)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest);
            }
        }
        let entry = self.entries.entry(addr.to_string()).or_insert(FailureWindow {
            count: 0,
            window_start: now,
        });
        if now.duration_since(entry.window_start) > self.window {
            entry.count = 1;
            entry.window_start = now;
        } else {
            entry.count += 1;
        }
    }

    /// Forget an address after a successful authentication.
    pub fn clear(&mut self, addr: &str) {
        self.entries.remove(addr);
    }
}

/// Default cap on distinct tracked addresses.
const MAX_TRACKED_ADDRESSES: usize = 10_000;

/// Validates inbound upgrade requests. Resolves accept/reject, never raises.
pub struct AuthGate {
    config: AuthConfig,
    tracker: Mutex<FailedAuthTracker>,
}

impl AuthGate {
    pub fn new(config: AuthConfig) -> Self {
        let window = Duration::from_secs(config.failed_window_secs);
        Self {
            config,
            tracker: Mutex::new(FailedAuthTracker::new(window, MAX_TRACKED_ADDRESSES)),
        }
    }

    /// Run the full check sequence for an upgrade request. On success,
    /// returns the `user_id` to attach to the connection.
    pub async fn check(
        &self,
        registry: &ConnectionRegistry,
        remote_addr: &str,
        origin: Option<&str>,
        authorization: Option<&str>,
    ) -> Result<String, AuthRejection> {
        let now = Instant::now();

        // 1. Rate limit — applies even if the new attempt's credentials
        // would have been valid, so a brute-forcer gains nothing from a
        // late correct guess.
        {
            let mut tracker = self.tracker.lock().await;
            if tracker.is_limited(remote_addr, self.config.failed_max_attempts, now) {
                return Err(AuthRejection::RateLimited);
            }
        }

        // 2. Origin allow-list. Absent origin is permitted (non-browser
        // clients).
        if let Some(origin) = origin {
            if !self.config.allowed_origins.iter().any(|o| o == origin) {
                return Err(AuthRejection::OriginForbidden);
            }
        }

        // 3. Capacity, checked before the connection is created.
        registry
            .can_accept(remote_addr)
            .await
            .map_err(AuthRejection::OverCapacity)?;

        // 4. Credential extraction.
        let header = authorization.ok_or(AuthRejection::MalformedCredentials)?;
        let (username, password) =
            parse_basic(header).ok_or(AuthRejection::MalformedCredentials)?;
        if !is_valid_username(&username) {
            return Err(AuthRejection::MalformedCredentials);
        }

        // 5. Validation. Unconfigured server credentials always reject —
        // there is no default username/password on a networked deployment.
        if !self.config.is_configured() {
            warn!(addr = %remote_addr, "Rejecting connection: auth credentials not configured");
            return Err(AuthRejection::BadCredentials);
        }
        let user_ok = constant_time_eq(self.config.username.as_bytes(), username.as_bytes());
        let pass_ok = constant_time_eq(self.config.password.as_bytes(), password.as_bytes());
        if !(user_ok && pass_ok) {
            self.tracker.lock().await.record_failure(remote_addr, now);
            return Err(AuthRejection::BadCredentials);
        }

        // 6. Success clears the address's failure history.
        self.tracker.lock().await.clear(remote_addr);
        Ok(username)
    }
}

/// Parse an `Authorization: Basic base64(user:pass)` header value.
fn parse_basic(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Strict username pattern: alphanumeric plus `-`, `_`, `.`, `@`, 1-64 chars.
fn is_valid_username(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '@')
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of
/// `provided` length, so neither the mismatch position nor the secret's
/// length leaks through response timing.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() { provided[i] } else { 0xff };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

/// Verify a Basic-Auth header against the configured credentials. Used by
/// the authenticated REST routes (stats); the WebSocket path goes through
/// the full [`AuthGate`].
pub fn verify_basic(config: &AuthConfig, authorization: Option<&str>) -> bool {
    if !config.is_configured() {
        return false;
    }
    let Some((username, password)) = authorization.and_then(parse_basic) else {
        return false;
    };
    constant_time_eq(config.username.as_bytes(), username.as_bytes())
        && constant_time_eq(config.password.as_bytes(), password.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryLimits;

    fn basic(user: &str, pass: &str) -> String {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        format!("Basic {encoded}")
    }

    fn test_config() -> AuthConfig {
        AuthConfig {
            username: "deck".into(),
            password: "s3cret".into(),
            allowed_origins: vec!["https://deck.example.com".into()],
            ..AuthConfig::default()
        }
    }

    fn test_registry() -> ConnectionRegistry {
        ConnectionRegistry::new(RegistryLimits::default())
    }

    #[test]
    fn constant_time_eq_correct_for_leading_and_trailing_mismatch() {
        assert!(constant_time_eq(b"secret01", b"secret01"));
        assert!(!constant_time_eq(b"secret01", b"Xecret01"));
        assert!(!constant_time_eq(b"secret01", b"secret0X"));
    }

    #[test]
    fn constant_time_eq_handles_unequal_lengths() {
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn constant_time_eq_timing_does_not_track_mismatch_position() {
        // Same-length inputs differing at the first vs the last byte should
        // take statistically indistinguishable time. Loose bound: averages
        // within 3x of each other over many iterations — enough to catch an
        // early-return implementation, which differs by the input length.
        let expected = vec![b'a'; 4096];
        let mut early = expected.clone();
        early[0] = b'b';
        let mut late = expected.clone();
        late[4095] = b'b';

        const ITERS: u32 = 2000;
        let t_early = {
            let start = Instant::now();
            for _ in 0..ITERS {
                assert!(!constant_time_eq(&expected, std::hint::black_box(&early)));
            }
            start.elapsed()
        };
        let t_late = {
            let start = Instant::now();
            for _ in 0..ITERS {
                assert!(!constant_time_eq(&expected, std::hint::black_box(&late)));
            }
            start.elapsed()
        };
        let ratio = t_early.as_secs_f64() / t_late.as_secs_f64();
        assert!(
            (0.33..3.0).contains(&ratio),
            "timing ratio {ratio} suggests position-dependent comparison"
        );
    }

    #[test]
    fn parse_basic_accepts_password_with_colon() {
        let header = basic("deck", "pa:ss");
        let (user, pass) = parse_basic(&header).unwrap();
        assert_eq!(user, "deck");
        assert_eq!(pass, "pa:ss");
    }

    #[test]
    fn parse_basic_rejects_garbage() {
        assert!(parse_basic("Bearer abc").is_none());
        assert!(parse_basic("Basic !!!not-base64!!!").is_none());
        let no_colon = base64::engine::general_purpose::STANDARD.encode("no-separator");
        assert!(parse_basic(&format!("Basic {no_colon}")).is_none());
    }

    #[test]
    fn username_pattern_is_strict() {
        assert!(is_valid_username("deck-ops_1.a@example"));
        assert!(!is_valid_username(""));
        assert!(!is_valid_username("has space"));
        assert!(!is_valid_username("semi;colon"));
        assert!(!is_valid_username(&"x".repeat(65)));
    }

    #[test]
    fn tracker_window_resets_after_expiry() {
        let mut tracker = FailedAuthTracker::new(Duration::from_secs(900), 100);
        let t0 = Instant::now();
        for _ in 0..5 {
            tracker.record_failure("10.0.0.1", t0);
        }
        assert!(tracker.is_limited("10.0.0.1", 5, t0));
        // Window elapses; the entry is swept and the address is clean again.
        let t1 = t0 + Duration::from_secs(901);
        assert!(!tracker.is_limited("10.0.0.1", 5, t1));
    }

    #[test]
    fn tracker_is_bounded_under_many_addresses() {
        let mut tracker = FailedAuthTracker::new(Duration::from_secs(900), 8);
        let now = Instant::now();
        for i in 0..100 {
            tracker.record_failure(&format!("10.0.{}.{}", i / 256, i % 256), now);
        }
        assert!(tracker.entries.len() <= 8);
    }

    #[tokio::test]
    async fn sixth_attempt_rejected_even_with_correct_credentials() {
        let gate = AuthGate::new(test_config());
        let registry = test_registry();
        let wrong = basic("deck", "wrong");
        for _ in 0..5 {
            assert_eq!(
                gate.check(&registry, "10.0.0.9", None, Some(&wrong)).await,
                Err(AuthRejection::BadCredentials)
            );
        }
        let right = basic("deck", "s3cret");
        let rejection = gate
            .check(&registry, "10.0.0.9", None, Some(&right))
            .await
            .unwrap_err();
        assert_eq!(rejection, AuthRejection::RateLimited);
        assert_eq!(rejection.status(), StatusCode::TOO_MANY_REQUESTS);

        // A different address is unaffected.
        assert!(gate
            .check(&registry, "10.0.0.10", None, Some(&right))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn success_clears_failure_history() {
        let gate = AuthGate::new(test_config());
        let registry = test_registry();
        let wrong = basic("deck", "wrong");
        for _ in 0..4 {
            let _ = gate.check(&registry, "10.0.0.9", None, Some(&wrong)).await;
        }
        let right = basic("deck", "s3cret");
        assert_eq!(
            gate.check(&registry, "10.0.0.9", None, Some(&right)).await,
            Ok("deck".to_string())
        );
        // History cleared: four more failures don't trip the limit.
        for _ in 0..4 {
            let _ = gate.check(&registry, "10.0.0.9", None, Some(&wrong)).await;
        }
        assert!(gate
            .check(&registry, "10.0.0.9", None, Some(&right))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn origin_allow_list_is_enforced() {
        let gate = AuthGate::new(test_config());
        let registry = test_registry();
        let right = basic("deck", "s3cret");

        assert_eq!(
            gate.check(
                &registry,
                "10.0.0.1",
                Some("https://evil.example.com"),
                Some(&right)
            )
            .await,
            Err(AuthRejection::OriginForbidden)
        );
        assert!(gate
            .check(
                &registry,
                "10.0.0.1",
                Some("https://deck.example.com"),
                Some(&right)
            )
            .await
            .is_ok());
        // Absent origin: non-browser client, permitted.
        assert!(gate
            .check(&registry, "10.0.0.1", None, Some(&right))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn missing_or_malformed_header_is_unauthorized() {
        let gate = AuthGate::new(test_config());
        let registry = test_registry();
        assert_eq!(
            gate.check(&registry, "10.0.0.1", None, None).await,
            Err(AuthRejection::MalformedCredentials)
        );
        assert_eq!(
            gate.check(&registry, "10.0.0.1", None, Some("Bearer tok"))
                .await
                .unwrap_err()
                .status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn unconfigured_credentials_always_reject() {
        let gate = AuthGate::new(AuthConfig::default());
        let registry = test_registry();
        let header = basic("deck", "anything");
        assert_eq!(
            gate.check(&registry, "10.0.0.1", None, Some(&header)).await,
            Err(AuthRejection::BadCredentials)
        );
    }

    #[tokio::test]
    async fn capacity_check_precedes_credential_validation() {
        let gate = AuthGate::new(test_config());
        let registry = ConnectionRegistry::new(RegistryLimits {
            max_connections: 0,
            max_per_address: 5,
        });
        let right = basic("deck", "s3cret");
        assert_eq!(
            gate.check(&registry, "10.0.0.1", None, Some(&right)).await,
            Err(AuthRejection::OverCapacity(CapacityError::Global))
        );
    }
}
