//! HTTP route assembly.

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::ws;

pub mod health;
pub mod stats;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/events/stats", get(stats::stats))
        .route("/api/events/ws", get(ws::events_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
