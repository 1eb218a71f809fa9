//! Operations HTTP API.
//!
//! - GET /health
//! - GET /metrics (Prometheus text format)
//! - GET /v1/runtime/stats

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::error;

use crate::runtime::{RuntimeHandle, RuntimeStats};
use crate::telemetry::PrometheusSink;

/// Application state shared across handlers.
pub struct AppState {
    pub runtime: RuntimeHandle,
    pub metrics: Arc<PrometheusSink>,
    pub start_time: Instant,
}

/// Build the axum router with all ops routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/runtime/stats", get(runtime_stats))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub runtime_id: String,
    pub uptime_secs: f64,
    pub queue_depth: usize,
    pub pages_in_use: usize,
    pub capacity_pages: usize,
    pub backpressure: bool,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let stats = state.runtime.stats();
    let status = if stats.admission.backpressure {
        "degraded"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status: status.to_string(),
        runtime_id: stats.runtime_id,
        uptime_secs: state.start_time.elapsed().as_secs_f64(),
        queue_depth: stats.queue_depth,
        pages_in_use: stats.cache.pages_in_use,
        capacity_pages: stats.cache.capacity_pages,
        backpressure: stats.admission.backpressure,
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, StatusCode> {
    let body = state.metrics.render().map_err(|e| {
        error!(error = %e, "Failed to render metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

async fn runtime_stats(State(state): State<Arc<AppState>>) -> Json<RuntimeStats> {
    Json(state.runtime.stats())
}
