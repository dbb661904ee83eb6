//! HTTP surface of the code-run subsystem.
//!
//! Status codes are part of the contract: 202 on acceptance, 400 with
//! `{errorCode, message}` on validation failure, 404 for unknown or
//! evicted jobs, 204 for an empty claim, 401/403 for unauthorized runner
//! calls.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use runbox::{
    JobEventBus, JobQueue, JobRequest, JobStore, JobSubmission, RunnerEvent, ValidationError,
    apply_runner_event, job::now_millis, sanitize_submission,
};

use crate::config::{ServerConfig, clamp_timeout};

/// Shared handles behind every route.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Authoritative job registry.
    pub store: Arc<JobStore>,
    /// Pending-job FIFO.
    pub queue: Arc<JobQueue>,
    /// Side-channel event bus.
    pub bus: Arc<JobEventBus>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Route table over the shared state.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/run", post(submit_run))
        .route("/api/run/{job_id}", get(run_status))
        .route("/api/run/{job_id}/stream", get(crate::stream::job_stream))
        .route("/api/runner/jobs/claim", post(claim_job))
        .route("/api/runner/jobs/{job_id}/events", post(runner_event))
        .with_state(state)
}

/// Error surface of the HTTP routes.
#[derive(Debug)]
pub enum ApiError {
    /// Submission failed a validation rule.
    Validation(ValidationError),
    /// Request body did not parse into the expected shape.
    BadRequest(String),
    /// Job id is unknown or already evicted.
    NotFound(&'static str),
    /// Runner call without credentials.
    Unauthorized(&'static str),
    /// Runner call with wrong credentials.
    Forbidden(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Validation(error) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "errorCode": error.code(),
                    "message": error.to_string(),
                })),
            )
                .into_response(),
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "errorCode": "INVALID_REQUEST",
                    "message": message,
                })),
            )
                .into_response(),
            Self::NotFound(message) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "message": message })),
            )
                .into_response(),
            Self::Unauthorized(message) => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "message": message })),
            )
                .into_response(),
            Self::Forbidden(message) => (
                StatusCode::FORBIDDEN,
                Json(json!({ "message": message })),
            )
                .into_response(),
        }
    }
}

/// POST /api/run: validate, create a queued record and enqueue it.
async fn submit_run(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    let submission: JobSubmission =
        serde_json::from_value(body).map_err(|error| ApiError::BadRequest(error.to_string()))?;
    let sanitized = sanitize_submission(&submission).map_err(ApiError::Validation)?;

    let record = state.store.create(JobRequest {
        id: Uuid::new_v4().to_string(),
        timeout_ms: clamp_timeout(None, state.config.job_timeout_ms),
        created_at: now_millis(),
        job: sanitized,
    });
    state.queue.enqueue(record.id().to_string());
    tracing::info!(job_id = %record.id(), "job accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "jobId": record.id(), "status": record.status })),
    ))
}

/// GET /api/run/:jobId: poll the record projection.
async fn run_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .store
        .get(&job_id)
        .ok_or(ApiError::NotFound("Job not found"))?;
    Ok(Json(record.status_response()))
}

/// POST /api/runner/jobs/claim: hand the oldest pending job to a worker.
async fn claim_job(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    crate::auth::authorize_runner(state.config.runner_token.as_deref(), &headers)?;

    let Some(job_id) = state.queue.claim_next() else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    let record = state
        .store
        .get(&job_id)
        .ok_or(ApiError::NotFound("Job disappeared"))?;
    state.store.mark_running(&job_id, None);
    tracing::info!(job_id = %job_id, "job claimed by runner");
    Ok(Json(record.claimed()).into_response())
}

/// POST /api/runner/jobs/:jobId/events: ingest one runner event.
///
/// The event is parsed inside the handler so an unknown event type maps
/// to 400 rather than a framework rejection code.
async fn runner_event(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    crate::auth::authorize_runner(state.config.runner_token.as_deref(), &headers)?;

    if state.store.get(&job_id).is_none() {
        return Err(ApiError::NotFound("Job not found"));
    }
    let event: RunnerEvent =
        serde_json::from_value(body).map_err(|_| ApiError::BadRequest("Unknown event type".to_string()))?;

    apply_runner_event(&state.store, &state.bus, &job_id, event);
    Ok(StatusCode::NO_CONTENT)
}
