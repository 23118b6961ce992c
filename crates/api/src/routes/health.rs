use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Jobs waiting for a slot.
    pub queued: usize,
    /// Jobs with a running process.
    pub active: usize,
    /// Maximum number of concurrently running jobs.
    pub capacity: usize,
}

/// GET /health -- service health and engine load.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.orchestrator.stats().await;

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        queued: stats.queued,
        active: stats.active,
        capacity: stats.capacity,
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
