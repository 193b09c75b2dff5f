use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use quantgate_core::error::CoreError;
use quantgate_worker::AdmissionError;
use serde_json::json;

/// Seconds a shed caller is told to wait before resubmitting.
const RETRY_AFTER_SECS: &str = "1";

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] and [`AdmissionError`] and adds HTTP-specific
/// variants. Implements [`IntoResponse`] to produce consistent JSON error
/// responses of the form `{ "success": false, "message": ..., "code": ... }`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A job was refused at admission.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => match core {
                CoreError::NotFound { entity, id } => (
                    StatusCode::NOT_FOUND,
                    "NOT_FOUND",
                    format!("{entity} with id {id} not found"),
                ),
                CoreError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                CoreError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
                CoreError::Misconfigured(msg) | CoreError::Internal(msg) => {
                    tracing::error!(error = %msg, "Internal core error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "An internal error occurred".to_string(),
                    )
                }
            },

            // --- Admission rejections ---
            AppError::Admission(err) => {
                let (status, code) = match err {
                    AdmissionError::Backpressure { .. } => {
                        (StatusCode::SERVICE_UNAVAILABLE, "BACKPRESSURE")
                    }
                    AdmissionError::RateLimited { .. } => {
                        (StatusCode::SERVICE_UNAVAILABLE, "RATE_LIMITED")
                    }
                    AdmissionError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
                    AdmissionError::ExpiredBeforeAdmission { .. } => {
                        (StatusCode::BAD_REQUEST, "EXPIRED_BEFORE_ADMISSION")
                    }
                    AdmissionError::DuplicateJobId(_) => (StatusCode::CONFLICT, "DUPLICATE_JOB_ID"),
                };
                (status, code, err.to_string())
            }

            // --- HTTP-specific errors ---
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
        };

        let body = json!({
            "success": false,
            "message": message,
            "code": code,
        });

        let mut response = (status, axum::Json(body)).into_response();
        if matches!(&self, AppError::Admission(err) if err.is_retryable()) {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}
