//! HTTP server for runtime operations.
//!
//! - [`ops_api`]: health, Prometheus metrics and runtime statistics
//!
//! Inference requests never arrive over this surface.

pub mod ops_api;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use ops_api::{build_router, AppState};

/// Router with request tracing.
pub fn app(state: Arc<AppState>) -> Router {
    build_router(state).layer(TraceLayer::new_for_http())
}

/// Serve the ops API until `shutdown` resolves.
pub async fn serve(
    state: Arc<AppState>,
    listen: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!(addr = listen, "Ops server listening");
    info!("  GET /health - Health check");
    info!("  GET /metrics - Prometheus metrics");
    info!("  GET /v1/runtime/stats - Runtime statistics");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::runtime::Runtime;
    use crate::telemetry::PrometheusSink;
    use crate::worker::backend::SyntheticBackend;

    fn state() -> (Runtime, Arc<AppState>) {
        let mut config = Config::default();
        config.cache.capacity_pages = 32;
        config.scheduler.memory_budget_pages = 32;
        config.model.kv_dim = 8;
        let metrics = Arc::new(PrometheusSink::new().unwrap());
        let runtime = Runtime::start(config, Arc::new(SyntheticBackend::new(8)), metrics.clone()).unwrap();
        let state = Arc::new(AppState {
            runtime: runtime.handle(),
            metrics,
            start_time: Instant::now(),
        });
        (runtime, state)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (runtime, state) = state();
        let (status, body) = get(app(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["capacity_pages"], 32);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats_and_metrics() {
        let (runtime, state) = state();
        let outcome = runtime
            .handle()
            .submit(crate::sequence::Request::generate(16, 4))
            .unwrap()
            .wait()
            .await;
        assert!(matches!(outcome, crate::admission::RequestOutcome::Completed { .. }));

        let (status, body) = get(app(state.clone()), "/v1/runtime/stats").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["admission"]["completed"], 1);

        let (status, body) = get(app(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("kvsched_batches_total"));
        runtime.shutdown().await;
    }
}
