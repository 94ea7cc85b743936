#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # agentdeck
//!
//! Dashboard backend for agent orchestration. Serves the real-time event
//! WebSocket that dashboard clients subscribe to, plus a small REST surface.
//!
//! ## API surface
//!
//! | Method | Path                | Auth | Description                      |
//! |--------|---------------------|------|----------------------------------|
//! | GET    | `/api/health`       | No   | Liveness probe                   |
//! | GET    | `/api/events/stats` | Yes  | Connection statistics            |
//! | GET    | `/api/events/ws`    | Yes  | Event stream WebSocket           |
//!
//! WebSocket auth is `Authorization: Basic` on the upgrade request, checked
//! before the upgrade completes.

use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use agentdeck_protocol::GatewayState;
use agentdeck_server::{routes, AppState, Config};

/// Dashboard backend for agent orchestration.
#[derive(Parser)]
#[command(name = "agentdeck", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("agentdeck v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if !config.auth.is_configured() {
        warn!("Auth credentials not configured — every connection will be rejected. Set AGENTDECK_USERNAME and AGENTDECK_PASSWORD or update config");
    }

    let state = AppState::new(config);
    let app = routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    let heartbeat_task = agentdeck_server::heartbeat::spawn(
        state.registry.clone(),
        state.config.heartbeat.clone(),
    );

    info!("Server ready");
    state
        .broadcaster
        .gateway_status(GatewayState::Running, state.uptime_secs())
        .await;

    // Graceful shutdown on SIGINT/SIGTERM
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .expect("Server error");

    // Cleanup: tell every client the gateway is stopping, then close the
    // sockets with the server-shutdown code so they reconnect later.
    info!("Shutting down...");
    heartbeat_task.abort();
    state
        .broadcaster
        .gateway_status(GatewayState::Stopped, state.uptime_secs())
        .await;
    state.registry.close_all().await;
    info!("Goodbye");
}
