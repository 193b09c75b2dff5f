use quantgate_core::job::{JobKind, JobSource};
use quantgate_core::metric_names::{
    REASON_BACKPRESSURE, REASON_DUPLICATE, REASON_EXPIRED, REASON_FAIRNESS, REASON_VALIDATION,
};
use quantgate_core::types::{JobId, Timestamp};

/// Why a job was not admitted.
///
/// Every variant is an expected outcome returned synchronously to the
/// caller; none of them is a fault in the engine.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Queue is full ({depth}/{max}), retry later")]
    Backpressure { depth: usize, max: usize },

    #[error("Deadline {deadline} has already passed")]
    ExpiredBeforeAdmission { deadline: Timestamp },

    #[error("Too many submissions from source '{from}', retry later")]
    RateLimited { from: JobSource },

    #[error("A job with id {0} already exists")]
    DuplicateJobId(JobId),
}

impl AdmissionError {
    /// Rejection reason label used in metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::Validation(_) => REASON_VALIDATION,
            AdmissionError::Backpressure { .. } => REASON_BACKPRESSURE,
            AdmissionError::ExpiredBeforeAdmission { .. } => REASON_EXPIRED,
            AdmissionError::RateLimited { .. } => REASON_FAIRNESS,
            AdmissionError::DuplicateJobId(_) => REASON_DUPLICATE,
        }
    }

    /// Whether the caller should back off and try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdmissionError::Backpressure { .. } | AdmissionError::RateLimited { .. }
        )
    }
}

/// Failure reported by (or on behalf of) a job handler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("Job observed its cancellation signal")]
    Canceled,

    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error("No handler registered for kind '{0}'")]
    NoHandler(JobKind),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Failed(_) | HandlerError::Panicked(_))
    }
}

/// Resource sampling failure. The monitor treats it as "over limit".
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected format in {path}")]
    Parse { path: &'static str },

    #[error("Probe unavailable: {0}")]
    Unavailable(String),
}
