//! Health check endpoints
//!
//! `/health` for liveness probes, `/health/details` for operators.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use camcast_sfu::{RegistryStats, WorkerInfo};
use serde::Serialize;

use crate::http::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthDetails {
    pub status: &'static str,
    pub workers: Vec<WorkerInfo>,
    pub rooms: RegistryStats,
}

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/details", get(health_details))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

/// Worker and room statistics
pub async fn health_details(State(state): State<AppState>) -> Json<HealthDetails> {
    let registry = state.gateway.registry();
    let workers = registry.pool().workers();
    let status = if workers.iter().all(|w| w.alive) {
        "ok"
    } else {
        "degraded"
    };
    Json(HealthDetails {
        status,
        workers,
        rooms: registry.stats().await,
    })
}
