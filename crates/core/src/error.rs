use crate::types::JobId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: JobId },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Startup configuration is unusable. The only error allowed to abort
    /// construction of an engine.
    #[error("Misconfigured: {0}")]
    Misconfigured(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
