//! Route definitions for the `/optimizer` resource.

use axum::routing::{delete, get, post};
use axum::Router;

use crate::handlers::{events, optimizer};
use crate::state::AppState;

/// Routes mounted at `/optimizer`.
///
/// ```text
/// POST   /enqueue              -> enqueue
/// GET    /status               -> engine_status
/// GET    /status/{job_id}      -> job_status
/// DELETE /cancel/{job_id}      -> cancel
/// GET    /jobs                 -> list_jobs
/// GET    /metrics              -> metrics
/// GET    /health               -> health
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/enqueue", post(optimizer::enqueue))
        .route("/status", get(optimizer::engine_status))
        .route("/status/{job_id}", get(optimizer::job_status))
        .route("/cancel/{job_id}", delete(optimizer::cancel))
        .route("/jobs", get(optimizer::list_jobs))
        .route("/metrics", get(optimizer::metrics))
        .route("/health", get(optimizer::health))
}

/// Long-lived streams, mounted at `/optimizer/events`.
///
/// ```text
/// GET    /{job_id}             -> stream_progress (SSE)
/// ```
pub fn stream_router() -> Router<AppState> {
    Router::new().route("/{job_id}", get(events::stream_progress))
}
