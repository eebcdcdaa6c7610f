use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use crate::connection::ClusterConnectionManager;
use crate::health::HealthChecker;
use crate::rate_limiter::{PolicyDescription, RateLimiterRegistry};
use crate::realtime::RealtimeHub;
use crate::response::ReadinessResponse;

/// Everything the routes share. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<ClusterConnectionManager>,
    pub registry: Arc<RateLimiterRegistry>,
    pub hub: Arc<RealtimeHub>,
    pub health: Arc<HealthChecker>,
    pub trust_proxy: bool,
}

#[derive(Debug, Serialize)]
pub struct PolicyTable {
    pub enabled: bool,
    pub policies: Vec<PolicyDescription>,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.check_health().await)
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.health.cluster_ready() {
        (StatusCode::OK, Json(ReadinessResponse::ready()))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse::not_ready()),
        )
    }
}

/// Lists the effective HTTP policies.
pub async fn list_policies(State(state): State<AppState>) -> Json<PolicyTable> {
    Json(PolicyTable {
        enabled: state.registry.is_enabled(),
        policies: state.registry.describe(),
    })
}

/// Stand-in for the application routes mounted behind each policy.
pub async fn accepted() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
