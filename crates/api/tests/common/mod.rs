#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use quantgate_api::config::ServerConfig;
use quantgate_api::router::build_app_router;
use quantgate_api::state::AppState;
use quantgate_api::workloads::{simulated_registry, WorkloadConfig};
use quantgate_core::limits::{Limits, WorkerPoolConfig};
use quantgate_worker::{Controller, EngineSettings, InMemoryJobStore, ManualProbe};
use serde_json::Value;
use tower::ServiceExt;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
    }
}

/// Fast-ticking engine settings with a small queue.
pub fn test_settings() -> EngineSettings {
    EngineSettings {
        limits: Limits {
            max_concurrent_jobs: 2,
            max_queue_depth: 10,
            ..Limits::default()
        },
        pool: WorkerPoolConfig {
            min_workers: 1,
            max_workers: 2,
            burst_capacity: 0,
            ..WorkerPoolConfig::default()
        },
        sample_interval: Duration::from_millis(20),
        tick_interval: Duration::from_millis(5),
        shutdown_grace: Duration::from_millis(200),
        retry_base: Duration::from_millis(5),
        ..EngineSettings::default()
    }
}

/// Simulated workloads that finish in a few milliseconds.
pub fn fast_workloads() -> WorkloadConfig {
    WorkloadConfig {
        session_tick: Duration::from_millis(1),
        session_ticks: 3,
        backtest_batch: Duration::from_millis(1),
        evaluation: Duration::from_millis(1),
        patience: 100,
    }
}

/// Build the full application router (same middleware stack as `main.rs`)
/// over a fresh, *stopped* engine. Tests start it when they need dispatch.
pub fn build_test_app(settings: EngineSettings) -> (Router, Arc<Controller>) {
    let controller = Arc::new(
        Controller::new(
            settings,
            Arc::new(InMemoryJobStore::new()),
            Arc::new(ManualProbe::new(10.0, 256)),
            simulated_registry(fast_workloads()),
        )
        .expect("test settings are valid"),
    );
    let config = test_config();
    let state = AppState {
        controller: Arc::clone(&controller),
        config: Arc::new(config.clone()),
    };
    (build_app_router(state, &config), controller)
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::GET, uri, Body::empty()).await
}

pub async fn delete(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::DELETE, uri, Body::empty()).await
}

pub async fn post_json(app: Router, uri: &str, body: Value) -> Response<Body> {
    post_raw(app, uri, body.to_string()).await
}

pub async fn post_raw(app: Router, uri: &str, body: String) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

async fn send(app: Router, method: Method, uri: &str, body: Body) -> Response<Body> {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(body)
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    String::from_utf8(body_bytes(response).await).unwrap()
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

pub fn backtest_body(priority: &str) -> Value {
    serde_json::json!({
        "kind": "backtest",
        "priority": priority,
        "payload": {
            "strategyId": "vegas",
            "symbol": "ETHUSDT",
            "timeframe": "1h",
            "start": "2024-01-01T00:00:00Z",
            "end": "2024-02-01T00:00:00Z",
        },
    })
}

pub fn optimize_body() -> Value {
    serde_json::json!({
        "kind": "optimize",
        "priority": "normal",
        "payload": {
            "strategyId": "vegas",
            "symbol": "BTCUSDT",
            "timeframe": "4h",
            "start": "2024-01-01T00:00:00Z",
            "end": "2024-03-01T00:00:00Z",
            "space": { "fast": [5.0, 10.0], "slow": [20.0, 30.0] },
        },
    })
}
