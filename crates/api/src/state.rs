use std::sync::Arc;

use quantgate_worker::Controller;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// The admission and scheduling engine.
    pub controller: Arc<Controller>,
    pub config: Arc<ServerConfig>,
}
