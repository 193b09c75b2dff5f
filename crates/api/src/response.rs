//! Response bodies for the `/optimizer` contract.
//!
//! Mutating endpoints answer with a `{ "success": ..., ... }` envelope;
//! failures share the same shape through [`AppError`](crate::error::AppError).

use quantgate_core::types::JobId;
use serde::Serialize;

/// `POST /optimizer/enqueue` success body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub success: bool,
    pub job_id: JobId,
}

/// `DELETE /optimizer/cancel/{job_id}` body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub success: bool,
    pub job_id: JobId,
    pub message: String,
}

/// `GET /optimizer/health` body.
#[derive(Debug, Serialize)]
pub struct EngineHealthResponse<T: Serialize> {
    /// `healthy` or `unhealthy`.
    pub status: &'static str,
    pub details: T,
}
