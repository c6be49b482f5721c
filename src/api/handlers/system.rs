use super::AppState;
use crate::api::models::HealthResponse;
use crate::plugin::HOST_VERSION;
use axum::{extract::State, Json};
use chrono::Utc;

/// Handler for GET /api/health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        host_version: HOST_VERSION.to_string(),
        profile: state.manager.profile().to_string(),
        extensions: state.manager.list().await.len(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        cache: state.manager.cache_stats(),
        timestamp: Utc::now().timestamp(),
    })
}
