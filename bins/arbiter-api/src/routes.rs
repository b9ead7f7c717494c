use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/submissions", post(handlers::submit))
        .route("/submissions/:id", get(handlers::get_submission))
        .route("/health", get(handlers::health_check))
        .route("/health/queue", get(handlers::queue_health))
        .route("/metrics", get(handlers::prometheus_metrics))
}
