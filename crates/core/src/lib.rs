//! Quantgate domain types and pure scheduling logic.
//!
//! No runtime state lives here: jobs, payload schemas, limits, the status
//! state machine, backoff math, and autoscaling decisions are shared by the
//! engine (`quantgate-worker`) and the HTTP layer (`quantgate-api`).

pub mod autoscale;
pub mod backoff;
pub mod error;
pub mod job;
pub mod limits;
pub mod metric_names;
pub mod payload;
pub mod scheduling;
pub mod types;
