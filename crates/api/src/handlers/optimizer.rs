//! Handlers for the `/optimizer` resource.
//!
//! Thin adapters over [`Controller`](quantgate_worker::Controller): every
//! admission outcome is a typed result mapped to HTTP by [`AppError`].

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use quantgate_core::error::CoreError;
use quantgate_core::job::{Job, JobRequest, JobStatus};
use quantgate_core::types::JobId;
use quantgate_worker::EngineStatus;
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::response::{CancelResponse, EngineHealthResponse, EnqueueResponse};
use crate::state::AppState;

/// Content type of the Prometheus text exposition format.
const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

async fn find_job(state: &AppState, id: JobId) -> AppResult<Job> {
    state
        .controller
        .get_job(id)
        .await
        .ok_or(AppError::Core(CoreError::NotFound { entity: "job", id }))
}

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

/// POST /optimizer/enqueue
///
/// Admit a job or reject it synchronously. A malformed body is reported in
/// the same `{ success: false, message }` shape as an admission rejection,
/// as is a malformed job id on the routes below.
pub async fn enqueue(
    State(state): State<AppState>,
    body: Result<Json<JobRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(request) = body?;

    let job = state.controller.enqueue_job(request).await?;

    tracing::info!(
        job_id = %job.id,
        kind = %job.kind,
        priority = %job.priority,
        "Job enqueued",
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            success: true,
            job_id: job.id,
        }),
    ))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// GET /optimizer/status
pub async fn engine_status(State(state): State<AppState>) -> Json<EngineStatus> {
    Json(state.controller.get_status().await)
}

/// GET /optimizer/status/{job_id}
pub async fn job_status(
    State(state): State<AppState>,
    path: Result<Path<JobId>, PathRejection>,
) -> AppResult<Json<Job>> {
    let Path(job_id) = path?;
    Ok(Json(find_job(&state, job_id).await?))
}

/// GET /optimizer/jobs
pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<Job>> {
    Json(state.controller.list_jobs().await)
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// DELETE /optimizer/cancel/{job_id}
///
/// Unknown ids are 404. A job that already finished answers 200 with
/// `success: false`; cancelling a running job only raises its signal.
pub async fn cancel(
    State(state): State<AppState>,
    path: Result<Path<JobId>, PathRejection>,
) -> AppResult<Json<CancelResponse>> {
    let Path(job_id) = path?;
    let job = find_job(&state, job_id).await?;
    let was_running = job.status == JobStatus::Running;

    let success = state.controller.cancel_job(job_id).await;
    let message = match (success, was_running) {
        (true, true) => "Cancellation requested".to_string(),
        (true, false) => "Job canceled".to_string(),
        (false, _) => {
            let current = find_job(&state, job_id).await?;
            format!("Job already finished with status {}", current.status)
        }
    };

    tracing::info!(job_id = %job_id, success, "Cancel requested");

    Ok(Json(CancelResponse {
        success,
        job_id,
        message,
    }))
}

// ---------------------------------------------------------------------------
// Observability
// ---------------------------------------------------------------------------

/// GET /optimizer/metrics
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, METRICS_CONTENT_TYPE)],
        state.controller.render_metrics().await,
    )
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthDetails {
    started: bool,
    queue_depth: usize,
    max_queue_depth: usize,
    running_count: usize,
    worker_count: usize,
    cpu_percent: f64,
    memory_mb: u64,
    sample_ok: bool,
    over_limit_for_ms: Option<u64>,
}

/// GET /optimizer/health
///
/// 200 when healthy, 503 otherwise.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.controller.get_status().await;
    let details = HealthDetails {
        started: status.started,
        queue_depth: status.queue_depth,
        max_queue_depth: status.limits.max_queue_depth,
        running_count: status.running_count,
        worker_count: status.worker_count,
        cpu_percent: status.resources.cpu_percent,
        memory_mb: status.resources.memory_mb,
        sample_ok: status.resources.sample_ok,
        over_limit_for_ms: status.resources.over_limit_for_ms,
    };

    let (code, label) = if status.is_healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    (
        code,
        Json(EngineHealthResponse {
            status: label,
            details,
        }),
    )
}
