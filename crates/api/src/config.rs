use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use quantgate_core::limits::{Limits, WorkerPoolConfig};
use quantgate_worker::{EngineSettings, FairnessConfig};

/// Server configuration loaded from environment variables.
///
/// All fields have sensible defaults suitable for local development.
/// In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Upper bound on engine shutdown after the listener closes (default: `30`).
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                    |
    /// |------------------------|----------------------------|
    /// | `HOST`                 | `0.0.0.0`                  |
    /// | `PORT`                 | `3000`                     |
    /// | `CORS_ORIGINS`         | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                       |
    /// | `SHUTDOWN_TIMEOUT_SECS`| `30`                       |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable
    /// source. Panics on malformed values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".into());

        let cors_origins: Vec<String> = lookup("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            host,
            port: parse_var(&lookup, "PORT", 3000),
            cors_origins,
            request_timeout_secs: parse_var(&lookup, "REQUEST_TIMEOUT_SECS", 30),
            shutdown_timeout_secs: parse_var(&lookup, "SHUTDOWN_TIMEOUT_SECS", 30),
        }
    }
}

/// Engine settings loaded from `QG_*` environment variables.
///
/// The engine never reads the environment itself; this is the one place
/// its [`EngineSettings`] are assembled.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub settings: EngineSettings,
}

impl EngineConfig {
    /// | Env Var                       | Default   |
    /// |-------------------------------|-----------|
    /// | `QG_MAX_CONCURRENT_JOBS`      | `8`       |
    /// | `QG_MAX_QUEUE_DEPTH`          | `200`     |
    /// | `QG_CPU_LIMIT_PERCENT`        | `85`      |
    /// | `QG_MEMORY_LIMIT_MB`          | `4096`    |
    /// | `QG_STEP_LATENCY_LIMIT_MS`    | `30000`   |
    /// | `QG_QUEUE_WAIT_LIMIT_MS`      | `300000`  |
    /// | `QG_MIN_WORKERS`              | `2`       |
    /// | `QG_MAX_WORKERS`              | `8`       |
    /// | `QG_BURST_CAPACITY`           | `2`       |
    /// | `QG_WORKER_CPU_LIMIT`         | `80`      |
    /// | `QG_WORKER_MEMORY_LIMIT_MB`   | `4096`    |
    /// | `QG_SAMPLE_INTERVAL_MS`       | `1000`    |
    /// | `QG_TICK_INTERVAL_MS`         | `100`     |
    /// | `QG_SHUTDOWN_GRACE_MS`        | `10000`   |
    /// | `QG_RETRY_BASE_MS`            | `500`     |
    /// | `QG_FAIRNESS_CAPACITY`        | unset (no fairness limit) |
    /// | `QG_FAIRNESS_REFILL_PER_SEC`  | `1`       |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable
    /// source. Panics on malformed values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let base = EngineSettings::default();
        let limits_default = Limits::default();
        let pool_default = WorkerPoolConfig::default();

        let limits = Limits {
            max_concurrent_jobs: parse_var(
                &lookup,
                "QG_MAX_CONCURRENT_JOBS",
                limits_default.max_concurrent_jobs,
            ),
            max_queue_depth: parse_var(&lookup, "QG_MAX_QUEUE_DEPTH", limits_default.max_queue_depth),
            cpu_limit_percent: parse_var(
                &lookup,
                "QG_CPU_LIMIT_PERCENT",
                limits_default.cpu_limit_percent,
            ),
            memory_limit_mb: parse_var(&lookup, "QG_MEMORY_LIMIT_MB", limits_default.memory_limit_mb),
            step_latency_limit_ms: parse_var(
                &lookup,
                "QG_STEP_LATENCY_LIMIT_MS",
                limits_default.step_latency_limit_ms,
            ),
            queue_wait_limit_ms: parse_var(
                &lookup,
                "QG_QUEUE_WAIT_LIMIT_MS",
                limits_default.queue_wait_limit_ms,
            ),
        };

        let pool = WorkerPoolConfig {
            min_workers: parse_var(&lookup, "QG_MIN_WORKERS", pool_default.min_workers),
            max_workers: parse_var(&lookup, "QG_MAX_WORKERS", pool_default.max_workers),
            burst_capacity: parse_var(&lookup, "QG_BURST_CAPACITY", pool_default.burst_capacity),
            cpu_limit: parse_var(&lookup, "QG_WORKER_CPU_LIMIT", pool_default.cpu_limit),
            memory_limit: parse_var(
                &lookup,
                "QG_WORKER_MEMORY_LIMIT_MB",
                pool_default.memory_limit,
            ),
            ..pool_default
        };

        let fairness = lookup("QG_FAIRNESS_CAPACITY").map(|raw| FairnessConfig {
            capacity: parse_value("QG_FAIRNESS_CAPACITY", &raw),
            refill_per_sec: parse_var(
                &lookup,
                "QG_FAIRNESS_REFILL_PER_SEC",
                FairnessConfig::default().refill_per_sec,
            ),
        });

        let settings = EngineSettings {
            limits,
            pool,
            sample_interval: millis_var(&lookup, "QG_SAMPLE_INTERVAL_MS", base.sample_interval),
            tick_interval: millis_var(&lookup, "QG_TICK_INTERVAL_MS", base.tick_interval),
            shutdown_grace: millis_var(&lookup, "QG_SHUTDOWN_GRACE_MS", base.shutdown_grace),
            retry_base: millis_var(&lookup, "QG_RETRY_BASE_MS", base.retry_base),
            fairness,
            ..base
        };

        Self { settings }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => default,
    }
}

fn parse_value<T>(key: &str, raw: &str) -> T
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .unwrap_or_else(|e| panic!("{key} must be a valid {}: {e}", std::any::type_name::<T>()))
}

fn millis_var(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    Duration::from_millis(parse_var(lookup, key, default.as_millis() as u64))
}
