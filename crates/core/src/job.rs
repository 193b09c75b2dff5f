//! Job model: kinds, priorities, sources, statuses, and the [`Job`] record.
//!
//! Wire representation is camelCase / lowercase enums so the HTTP layer can
//! serialize snapshots without a separate DTO.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::payload::JobPayload;
use crate::types::{new_job_id, JobId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Deadline applied when a request omits one, in hours from admission.
pub const DEFAULT_DEADLINE_HORIZON_HOURS: i64 = 24;

/// Retries granted when a request omits `maxRetries`.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Upper bound accepted for `maxRetries`.
pub const MAX_RETRIES_CEILING: u32 = 10;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// What kind of trading workload a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Live,
    Paper,
    Backtest,
    Optimize,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::Live,
        JobKind::Paper,
        JobKind::Backtest,
        JobKind::Optimize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Live => "live",
            JobKind::Paper => "paper",
            JobKind::Backtest => "backtest",
            JobKind::Optimize => "optimize",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority lane. Lanes are drained strictly in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    High,
    Normal,
    Low,
}

impl JobPriority {
    /// Lanes in drain order.
    pub const LANES: [JobPriority; 3] = [JobPriority::High, JobPriority::Normal, JobPriority::Low];

    /// Zero-based lane index; lower drains first.
    pub fn lane(&self) -> usize {
        match self {
            JobPriority::High => 0,
            JobPriority::Normal => 1,
            JobPriority::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who submitted the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSource {
    Api,
    Scheduler,
    Retry,
}

impl JobSource {
    pub const ALL: [JobSource; 3] = [JobSource::Api, JobSource::Scheduler, JobSource::Retry];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::Api => "api",
            JobSource::Scheduler => "scheduler",
            JobSource::Retry => "retry",
        }
    }
}

impl fmt::Display for JobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status. See [`crate::scheduling::state_machine`] for the
/// allowed transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Enqueued,
    Running,
    Succeeded,
    Failed,
    Expired,
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Enqueued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Expired,
        JobStatus::Canceled,
    ];

    /// Whether the status is one of the end states.
    ///
    /// `Failed` counts as terminal here; a failed job with a pending retry is
    /// distinguished at the [`Job`] level via [`Job::next_retry_at`].
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Expired | JobStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Enqueued => "enqueued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Expired => "expired",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// JobRequest
// ---------------------------------------------------------------------------

/// An unvalidated submission, as received from a caller.
///
/// Every field is optional at the type level so that missing fields surface
/// as [`CoreError::Validation`] instead of a deserialization failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    #[serde(default)]
    pub id: Option<JobId>,
    #[serde(default)]
    pub kind: Option<JobKind>,
    #[serde(default)]
    pub priority: Option<JobPriority>,
    #[serde(default)]
    pub source: Option<JobSource>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub deadline: Option<Timestamp>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl JobRequest {
    /// Build a request from a typed payload with normal priority.
    pub fn new(payload: JobPayload) -> Self {
        Self {
            kind: Some(payload.kind()),
            priority: Some(JobPriority::Normal),
            payload: serde_json::to_value(&payload).ok(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_source(mut self, source: JobSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_deadline(mut self, deadline: Timestamp) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Validate required fields and the payload schema, producing a fresh
    /// [`Job`] in the `enqueued` state.
    ///
    /// Deadline freshness and capacity are admission concerns and are not
    /// checked here.
    pub fn into_job(self, now: Timestamp) -> Result<Job, CoreError> {
        let kind = self
            .kind
            .ok_or_else(|| CoreError::Validation("kind is required".to_string()))?;
        let priority = self
            .priority
            .ok_or_else(|| CoreError::Validation("priority is required".to_string()))?;
        let raw = self
            .payload
            .ok_or_else(|| CoreError::Validation("payload is required".to_string()))?;
        let payload = JobPayload::parse(kind, raw)?;

        let max_retries = self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        if max_retries > MAX_RETRIES_CEILING {
            return Err(CoreError::Validation(format!(
                "maxRetries must not exceed {MAX_RETRIES_CEILING}"
            )));
        }

        Ok(Job {
            id: self.id.unwrap_or_else(new_job_id),
            kind,
            priority,
            source: self.source.unwrap_or(JobSource::Api),
            payload,
            deadline: self
                .deadline
                .unwrap_or(now + chrono::Duration::hours(DEFAULT_DEADLINE_HORIZON_HOURS)),
            created_at: now,
            enqueued_at: now,
            status: JobStatus::Enqueued,
            retry_count: 0,
            max_retries,
            started_at: None,
            finished_at: None,
            error: None,
            next_retry_at: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of work tracked by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub priority: JobPriority,
    pub source: JobSource,
    pub payload: JobPayload,
    pub deadline: Timestamp,
    pub created_at: Timestamp,
    /// When the current attempt entered the queue. Equals `created_at` for
    /// the first attempt; reset on every retry re-admission.
    pub enqueued_at: Timestamp,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub error: Option<String>,
    /// Set while a failed job waits out its retry backoff.
    pub next_retry_at: Option<Timestamp>,
}

impl Job {
    /// True once the job can no longer change state.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal() && self.next_retry_at.is_none()
    }

    pub fn is_past_deadline(&self, now: Timestamp) -> bool {
        now > self.deadline
    }

    /// Whether another attempt is allowed after a failure.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Time the current attempt has spent waiting in the queue.
    pub fn queue_wait(&self, now: Timestamp) -> chrono::Duration {
        now.signed_duration_since(self.enqueued_at)
    }

    /// Record a terminal (or retry-pending) outcome.
    pub fn finish(&mut self, status: JobStatus, error: Option<String>) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        if error.is_some() {
            self.error = error;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
