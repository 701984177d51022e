//! Health Check Endpoint
//!
//! Liveness plus a few process facts. No caller identity required.

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, routing::get, Json, Router};

use crate::state::{AppState, StoreKind};
use crate::types::HealthResponse;
use crate::ws::Fanout;

/// GET /health
pub async fn health(
    State(fanout): State<Arc<Fanout>>,
    State(start_time): State<Instant>,
    State(store_kind): State<StoreKind>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: start_time.elapsed().as_secs(),
        live_sessions: fanout.session_count(),
        store: store_kind.as_str().to_string(),
    })
}

pub fn create_router() -> Router<AppState> {
    Router::new().route("/", get(health))
}
