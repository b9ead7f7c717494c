// HTTP route handlers for the Arbiter API

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use arbiter_common::service::{self, EnqueueError, EnqueueRequest, Intake, Viewer};
use arbiter_common::types::{SubmissionMode, SubmissionStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::AppState;

const USER_HEADER: &str = "x-user-id";
const ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub challenge_id: String,
    pub language: String,
    pub code: String,
    #[serde(default = "default_mode")]
    pub mode: SubmissionMode,
}

fn default_mode() -> SubmissionMode {
    SubmissionMode::Submit
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub submission_id: Uuid,
    pub status: SubmissionStatus,
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn viewer_from(headers: &HeaderMap) -> Viewer {
    if header_value(headers, ROLE_HEADER).is_some_and(|role| role.eq_ignore_ascii_case("admin")) {
        return Viewer::Admin;
    }
    match header_value(headers, USER_HEADER) {
        Some(user) => Viewer::User(user.to_string()),
        None => Viewer::Anonymous,
    }
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn rejection(err: &EnqueueError) -> (StatusCode, &'static str) {
    match err {
        EnqueueError::UnsupportedLanguage(_) => (StatusCode::BAD_REQUEST, "unsupported_language"),
        EnqueueError::UnknownChallenge(_) => (StatusCode::NOT_FOUND, "unknown_challenge"),
        EnqueueError::EmptyCode => (StatusCode::UNPROCESSABLE_ENTITY, "empty_code"),
        EnqueueError::CodeTooLarge { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "code_too_large"),
        EnqueueError::TooManyLines { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "too_many_lines"),
        EnqueueError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store"),
    }
}

/// POST /submissions - Queue a submission for judging
pub async fn submit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<SubmitRequest>,
) -> Response {
    let Some(user_id) = header_value(&headers, USER_HEADER) else {
        metrics::SUBMISSIONS_REJECTED.with_label_values(&["missing_user"]).inc();
        return error_body(StatusCode::BAD_REQUEST, format!("missing {} header", USER_HEADER));
    };

    let intake = Intake {
        catalog: &state.catalog,
        enabled_languages: state.languages.enabled(),
        limits: &state.limits,
        policy: state.policy,
    };
    let request = EnqueueRequest {
        user_id: user_id.to_string(),
        challenge_id: payload.challenge_id,
        language: payload.language.clone(),
        code: payload.code,
        mode: payload.mode,
    };

    match service::enqueue(state.store.as_ref(), &intake, request).await {
        Ok(submission_id) => {
            metrics::SUBMISSIONS_ACCEPTED
                .with_label_values(&[payload.language.as_str(), payload.mode.to_string().as_str()])
                .inc();
            (
                StatusCode::CREATED,
                Json(SubmitResponse {
                    submission_id,
                    status: SubmissionStatus::Queued,
                }),
            )
                .into_response()
        }
        Err(e) => {
            let (status, reason) = rejection(&e);
            metrics::SUBMISSIONS_REJECTED.with_label_values(&[reason]).inc();
            if status.is_server_error() {
                error!(error = %e, "Failed to queue submission");
                error_body(status, "failed to queue submission")
            } else {
                info!(user_id = %user_id, reason, "Submission rejected");
                error_body(status, e.to_string())
            }
        }
    }
}

/// GET /submissions/:id - Current status, results for the owner or an admin
pub async fn get_submission(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let Ok(submission_id) = Uuid::parse_str(&id) else {
        metrics::STATUS_QUERIES.with_label_values(&["bad_request"]).inc();
        return error_body(StatusCode::BAD_REQUEST, "Invalid submission ID format");
    };

    let viewer = viewer_from(&headers);
    match service::get_status(state.store.as_ref(), submission_id, &viewer).await {
        Ok(Some(view)) => {
            metrics::STATUS_QUERIES.with_label_values(&["found"]).inc();
            (StatusCode::OK, Json(view)).into_response()
        }
        Ok(None) => {
            metrics::STATUS_QUERIES.with_label_values(&["not_found"]).inc();
            error_body(StatusCode::NOT_FOUND, "submission not found")
        }
        Err(e) => {
            metrics::STATUS_QUERIES.with_label_values(&["error"]).inc();
            error!(submission_id = %submission_id, error = %e, "Failed to fetch submission");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "failed to query submission status")
        }
    }
}

/// GET /health - Liveness of the API process
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "challenges": state.catalog.len(),
            "languages": state.languages.enabled_languages(),
            "timestamp": chrono::Utc::now(),
        })),
    )
        .into_response()
}

/// GET /health/queue - Queue depth, worker liveness and average wait
pub async fn queue_health(State(state): State<Arc<AppState>>) -> Response {
    match service::get_queue_health(state.store.as_ref(), state.worker_liveness).await {
        Ok(health) => {
            if health.workers_alive == 0 && health.queue_depth > 0 {
                warn!(queue_depth = health.queue_depth, "Submissions queued with no live workers");
            }
            (StatusCode::OK, Json(health)).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to read queue health");
            error_body(StatusCode::SERVICE_UNAVAILABLE, "queue store unavailable")
        }
    }
}

/// GET /metrics - Prometheus exposition
pub async fn prometheus_metrics() -> Response {
    match metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
