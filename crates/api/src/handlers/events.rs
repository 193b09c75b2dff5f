//! Server-Sent Events stream of optimization progress for one job.

use std::convert::Infallible;

use axum::extract::rejection::PathRejection;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use futures::StreamExt;
use quantgate_core::types::JobId;
use quantgate_events::OptimizationEvent;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::AppResult;
use crate::state::AppState;

/// GET /optimizer/events/{job_id}
///
/// Streams `evaluation`, `completed`, `earlyStop` and `error` events in the
/// order the handler emitted them. The stream ends when the job finishes.
/// Unknown jobs are 404, already finished jobs 409.
pub async fn stream_progress(
    State(state): State<AppState>,
    path: Result<Path<JobId>, PathRejection>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let Path(job_id) = path?;
    let rx = state.controller.subscribe_progress(job_id).await?;
    tracing::debug!(job_id = %job_id, "Progress subscriber attached");

    let stream = ReceiverStream::new(rx).map(move |event| Ok(to_sse(job_id, &event)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse(job_id: JobId, event: &OptimizationEvent) -> Event {
    let sse = Event::default().event(event.name());
    match serde_json::to_string(event) {
        Ok(data) => sse.data(data),
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to serialize progress event");
            sse.data("{}")
        }
    }
}
