use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::services::CacheStats;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    status: String,
    persistent: bool,
    conversations: usize,
    cache: CacheStats,
}

pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

pub async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    (
        StatusCode::OK,
        Json(ReadinessResponse {
            status: "ready".to_string(),
            persistent: state.store.is_persistent(),
            conversations: state.store.len(),
            cache: state.cache().stats(),
        }),
    )
}
