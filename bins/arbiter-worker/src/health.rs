// Worker HTTP surface: liveness and Prometheus scrape endpoint.

use crate::limiter::ExecutionLimiter;
use crate::metrics;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

pub struct HealthState {
    pub worker_ids: Vec<String>,
    pub limiter: ExecutionLimiter,
}

pub fn routes(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health(State(state): State<Arc<HealthState>>) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "workers": state.worker_ids,
            "executions_in_flight": state.limiter.in_flight(),
            "peak_executions": state.limiter.peak(),
            "max_concurrent_executions": state.limiter.capacity(),
        })),
    )
        .into_response()
}

async fn metrics_handler() -> Response {
    match metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
