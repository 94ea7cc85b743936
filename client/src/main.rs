#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # deck-tail
//!
//! Follow the agentdeck event stream from a terminal: connects to the event
//! WebSocket, reconnects with backoff when the server goes away, and prints
//! each event as one JSON line.

use clap::Parser;
use tracing::{info, warn};

use agentdeck_client::{Endpoint, Status, Subscriber, SubscriberConfig, TerminalReason};

/// Follow the agentdeck event stream.
#[derive(Parser)]
#[command(name = "deck-tail", version)]
struct Cli {
    /// WebSocket URL, e.g. ws://127.0.0.1:4400/api/events/ws
    url: String,

    /// Basic-Auth username.
    #[arg(long, env = "DECK_USERNAME")]
    username: String,

    /// Basic-Auth password.
    #[arg(long, env = "DECK_PASSWORD", hide_env_values = true)]
    password: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    let (subscriber, mut events) = Subscriber::spawn(
        SubscriberConfig::default(),
        Endpoint {
            url: cli.url,
            username: cli.username,
            password: cli.password,
        },
    );

    let mut status = subscriber.status_watch();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!("Failed to re-serialize event: {e}"),
                },
                None => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                match *status.borrow_and_update() {
                    Status::Terminal(TerminalReason::AuthRejected) => {
                        eprintln!("deck-tail: authentication failed, not retrying");
                        std::process::exit(1);
                    }
                    Status::Terminal(TerminalReason::AttemptsExhausted) => {
                        eprintln!("deck-tail: server unreachable, giving up");
                        std::process::exit(1);
                    }
                    Status::Terminal(TerminalReason::Closed) => {
                        info!("Server closed the stream");
                        break;
                    }
                    status => info!(?status, "Status changed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                subscriber.shutdown().await;
                break;
            }
        }
    }
}
