//! Authenticated connection statistics for the dashboard's admin view.

use std::collections::HashMap;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::auth::verify_basic;
use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub connections: usize,
    pub max_connections: usize,
    pub max_per_address: usize,
    pub per_address: HashMap<String, usize>,
}

pub async fn stats(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let authorization = headers.get("authorization").and_then(|v| v.to_str().ok());
    if !verify_basic(&state.config.auth, authorization) {
        return (
            StatusCode::UNAUTHORIZED,
            [("www-authenticate", "Basic realm=\"agentdeck\"")],
            "unauthorized",
        )
            .into_response();
    }
    Json(StatsResponse {
        connections: state.registry.count().await,
        max_connections: state.config.server.max_connections,
        max_per_address: state.config.server.max_per_address,
        per_address: state.registry.address_counts().await,
    })
    .into_response()
}
