//! Delayed re-admission of failed jobs.
//!
//! A failed attempt with retries left stays `failed` with `next_retry_at`
//! set while it waits out its backoff, then goes back through
//! [`AdmissionController::readmit`]. The pending entry holds the job's own
//! cancellation token, so a cancel raised while the failure is being
//! recorded still reaches the retry. Whoever removes the token from the
//! pending map owns the job's next status change: the timer task, a cancel
//! request, or shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use quantgate_core::backoff::BackoffPolicy;
use quantgate_core::job::{Job, JobStatus};
use quantgate_core::types::JobId;
use quantgate_events::JobEventType;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionController;
use crate::error::{AdmissionError, HandlerError};
use crate::record::JobRecorder;

/// Error recorded on retries dropped by `stop()`.
pub const SHUTDOWN_REASON: &str = "shutdown";

/// What happened to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Scheduled { delay: Duration },
    Exhausted,
    Canceled,
}

pub struct RetryManager {
    admission: Arc<AdmissionController>,
    recorder: JobRecorder,
    backoff: BackoffPolicy,
    pending: Mutex<HashMap<JobId, CancellationToken>>,
}

impl RetryManager {
    pub fn new(
        admission: Arc<AdmissionController>,
        recorder: JobRecorder,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            admission,
            recorder,
            backoff,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a failed attempt will be retried.
    pub fn will_retry(job: &Job, error: &HandlerError) -> bool {
        error.is_retryable() && job.has_retries_left()
    }

    /// Handle a failed attempt of a running job. `cancel` is the attempt's
    /// cancellation token; once raised the job ends `canceled` instead of
    /// being retried.
    pub async fn on_failure(
        self: &Arc<Self>,
        mut job: Job,
        error: HandlerError,
        cancel: CancellationToken,
    ) -> RetryOutcome {
        let from = job.status;
        let message = error.to_string();

        if cancel.is_cancelled() {
            self.finish_canceled(job, from, "running", &message).await;
            return RetryOutcome::Canceled;
        }

        if !Self::will_retry(&job, &error) {
            job.finish(JobStatus::Failed, Some(message.clone()));
            job.next_retry_at = None;
            self.recorder
                .record(
                    &job,
                    from,
                    JobEventType::Failed,
                    serde_json::json!({ "error": message, "retryCount": job.retry_count }),
                )
                .await;
            tracing::warn!(
                job_id = %job.id,
                kind = %job.kind,
                retry_count = job.retry_count,
                error = %message,
                "Job failed permanently",
            );
            return RetryOutcome::Exhausted;
        }

        let delay = self.backoff.delay(job.retry_count);
        job.finish(JobStatus::Failed, Some(message.clone()));
        job.next_retry_at =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()));

        // Hold the pending map while recording so a concurrent cancel sees
        // either the old running job or the fully scheduled retry.
        let mut pending = self.pending.lock().await;
        self.recorder
            .record(
                &job,
                from,
                JobEventType::RetryScheduled,
                serde_json::json!({
                    "error": message,
                    "retryCount": job.retry_count,
                    "delayMs": delay.as_millis() as u64,
                }),
            )
            .await;
        pending.insert(job.id, cancel.clone());
        drop(pending);
        self.recorder.metrics.retry_scheduled(job.kind);
        tracing::info!(
            job_id = %job.id,
            kind = %job.kind,
            retry_count = job.retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "Job failed, retry scheduled",
        );

        let this = Arc::clone(self);
        tokio::spawn(async move { this.wait_and_readmit(job, delay, cancel).await });
        RetryOutcome::Scheduled { delay }
    }

    async fn wait_and_readmit(&self, job: Job, delay: Duration, token: CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
        if self.pending.lock().await.remove(&job.id).is_none() {
            return;
        }
        if token.is_cancelled() {
            let message = job.error.clone().unwrap_or_default();
            self.finish_canceled(job, JobStatus::Failed, "backoff", &message).await;
            return;
        }

        let mut attempt = job.clone();
        attempt.retry_count += 1;
        match self.admission.readmit(attempt).await {
            Ok(readmitted) => {
                tracing::debug!(
                    job_id = %readmitted.id,
                    retry_count = readmitted.retry_count,
                    "Retry re-admitted",
                );
            }
            Err(AdmissionError::ExpiredBeforeAdmission { .. }) => {
                let mut expired = job;
                expired.next_retry_at = None;
                expired.finish(
                    JobStatus::Expired,
                    Some("deadline passed before retry".to_string()),
                );
                self.recorder
                    .record(
                        &expired,
                        JobStatus::Failed,
                        JobEventType::Expired,
                        serde_json::json!({ "reason": "deadline" }),
                    )
                    .await;
            }
            Err(e) => {
                let mut failed = job;
                failed.next_retry_at = None;
                failed.finish(JobStatus::Failed, Some(format!("retry rejected: {e}")));
                self.recorder
                    .record(
                        &failed,
                        JobStatus::Failed,
                        JobEventType::Failed,
                        serde_json::json!({ "error": failed.error, "rejection": e.reason() }),
                    )
                    .await;
                tracing::warn!(job_id = %failed.id, error = %e, "Retry rejected, job failed");
            }
        }
    }

    async fn finish_canceled(&self, mut job: Job, from: JobStatus, phase: &str, detail: &str) {
        job.next_retry_at = None;
        job.finish(JobStatus::Canceled, None);
        self.recorder
            .record(
                &job,
                from,
                JobEventType::Canceled,
                serde_json::json!({ "phase": phase, "detail": detail }),
            )
            .await;
        tracing::info!(job_id = %job.id, kind = %job.kind, phase, "Job canceled");
    }

    /// Cancel a job waiting out its backoff. Returns false if none is pending.
    pub async fn cancel_pending(&self, id: JobId) -> bool {
        let Some(token) = self.pending.lock().await.remove(&id) else {
            return false;
        };
        token.cancel();

        let Some(mut job) = self.recorder.store.get(id).await else {
            return false;
        };
        let from = job.status;
        job.next_retry_at = None;
        job.finish(JobStatus::Canceled, None);
        self.recorder
            .record(&job, from, JobEventType::Canceled, serde_json::json!({ "phase": "backoff" }))
            .await
    }

    /// Drop every pending retry, failing the jobs with reason `shutdown`.
    pub async fn abandon_all(&self) -> usize {
        let drained: Vec<(JobId, CancellationToken)> =
            self.pending.lock().await.drain().collect();
        let count = drained.len();

        for (id, token) in drained {
            token.cancel();
            let Some(mut job) = self.recorder.store.get(id).await else {
                continue;
            };
            let from = job.status;
            job.next_retry_at = None;
            job.finish(JobStatus::Failed, Some(SHUTDOWN_REASON.to_string()));
            self.recorder
                .record(
                    &job,
                    from,
                    JobEventType::Failed,
                    serde_json::json!({ "error": SHUTDOWN_REASON }),
                )
                .await;
        }

        if count > 0 {
            tracing::info!(count, "Abandoned pending retries");
        }
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_pending(&self, id: JobId) -> bool {
        self.pending.lock().await.contains_key(&id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
