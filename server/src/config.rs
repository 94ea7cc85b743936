//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `AGENTDECK_USERNAME`, `AGENTDECK_PASSWORD`,
//!    `AGENTDECK_LISTEN`
//! 2. **Config file** — path via `--config <path>`, or `agentdeck.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:4400"
//! max_connections = 100
//! max_per_address = 5
//!
//! [auth]
//! username = "deck"
//! password = "your-secret"
//! allowed_origins = ["https://deck.example.com"]
//! failed_window_secs = 900
//! failed_max_attempts = 5
//!
//! [heartbeat]
//! interval_secs = 30
//! timeout_secs = 60
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and connection-limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:4400`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Global cap on concurrent event WebSocket connections (default 100).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Per-remote-address cap on concurrent connections (default 5).
    #[serde(default = "default_max_per_address")]
    pub max_per_address: usize,
}

/// Authentication settings for the event WebSocket.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Expected Basic-Auth username. Override with `AGENTDECK_USERNAME`.
    /// Empty (the default) means auth is unconfigured and every connection
    /// is rejected — there is no fallback credential.
    #[serde(default)]
    pub username: String,
    /// Expected Basic-Auth password. Override with `AGENTDECK_PASSWORD`.
    #[serde(default)]
    pub password: String,
    /// Origins allowed to open the WebSocket. Requests without an `Origin`
    /// header (non-browser clients) are always permitted.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Trailing window for failed-auth rate limiting, seconds (default 900).
    #[serde(default = "default_failed_window_secs")]
    pub failed_window_secs: u64,
    /// Failed attempts within the window before an address is rate-limited
    /// (default 5).
    #[serde(default = "default_failed_max_attempts")]
    pub failed_max_attempts: u32,
}

impl AuthConfig {
    /// Whether expected credentials have been configured at all.
    pub fn is_configured(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// Liveness heartbeat settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// Seconds between heartbeat sweeps (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
    /// Seconds without a pong before a connection is terminated (default 60).
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:4400".to_string()
}
fn default_max_connections() -> usize {
    100
}
fn default_max_per_address() -> usize {
    5
}
fn default_failed_window_secs() -> u64 {
    900
}
fn default_failed_max_attempts() -> u32 {
    5
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_heartbeat_timeout() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            max_per_address: default_max_per_address(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            allowed_origins: Vec::new(),
            failed_window_secs: default_failed_window_secs(),
            failed_max_attempts: default_failed_max_attempts(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            timeout_secs: default_heartbeat_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `agentdeck.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("agentdeck.toml").exists() {
            let content =
                std::fs::read_to_string("agentdeck.toml").expect("Failed to read agentdeck.toml");
            toml::from_str(&content).expect("Failed to parse agentdeck.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                auth: AuthConfig::default(),
                heartbeat: HeartbeatConfig::default(),
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(user) = std::env::var("AGENTDECK_USERNAME") {
            config.auth.username = user;
        }
        if let Ok(pass) = std::env::var("AGENTDECK_PASSWORD") {
            config.auth.password = pass;
        }
        if let Ok(listen) = std::env::var("AGENTDECK_LISTEN") {
            config.server.listen = listen;
        }

        config
    }
}
