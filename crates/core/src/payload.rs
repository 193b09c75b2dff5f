//! Typed job payloads, one schema per [`JobKind`].
//!
//! Payloads arrive as untyped JSON and are parsed with the schema selected
//! by the job's `kind`. Field-level rules use `validator`; cross-field rules
//! (time windows, optimization grid size) are schema-level checks. Anything
//! malformed is rejected at admission and never reaches a worker.

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::CoreError;
use crate::job::JobKind;
use crate::types::Timestamp;

/// Grid size limit applied when an optimize payload does not set one.
pub const DEFAULT_MAX_COMBINATIONS: u64 = 500;

/// Hard ceiling on `maxCombinations`, whatever the caller asks for.
pub const MAX_COMBINATIONS_CEILING: u64 = 10_000;

/// Candle timeframes accepted by backtest and optimize jobs.
pub const SUPPORTED_TIMEFRAMES: &[&str] = &["1m", "5m", "15m", "30m", "1h", "4h", "1d"];

// ---------------------------------------------------------------------------
// Per-kind schemas
// ---------------------------------------------------------------------------

/// Live execution against a real exchange account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LivePayload {
    #[validate(length(min = 1, max = 64))]
    pub strategy_id: String,
    #[validate(length(min = 1, max = 32))]
    pub symbol: String,
    #[validate(length(min = 1, max = 32))]
    pub exchange: String,
}

/// Paper execution with a simulated balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PaperPayload {
    #[validate(length(min = 1, max = 64))]
    pub strategy_id: String,
    #[validate(length(min = 1, max = 32))]
    pub symbol: String,
    #[validate(range(exclusive_min = 0.0))]
    pub initial_balance: f64,
}

/// Historical replay of a strategy over a time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[validate(schema(function = "check_backtest"))]
pub struct BacktestPayload {
    #[validate(length(min = 1, max = 64))]
    pub strategy_id: String,
    #[validate(length(min = 1, max = 32))]
    pub symbol: String,
    pub timeframe: String,
    pub start: Timestamp,
    pub end: Timestamp,
}

/// Objective maximised by a parameter search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Objective {
    #[default]
    Sharpe,
    Pnl,
    WinRate,
}

/// Grid search over strategy parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[validate(schema(function = "check_optimize"))]
pub struct OptimizePayload {
    #[validate(length(min = 1, max = 64))]
    pub strategy_id: String,
    #[validate(length(min = 1, max = 32))]
    pub symbol: String,
    pub timeframe: String,
    pub start: Timestamp,
    pub end: Timestamp,
    /// Parameter name to candidate values.
    pub space: BTreeMap<String, Vec<f64>>,
    #[serde(default)]
    pub objective: Objective,
    #[serde(default)]
    pub early_stop: bool,
    #[serde(default)]
    pub max_combinations: Option<u64>,
}

impl OptimizePayload {
    /// Number of parameter combinations the grid expands to (saturating).
    pub fn combinations(&self) -> u64 {
        if self.space.is_empty() {
            return 0;
        }
        self.space
            .values()
            .fold(1u64, |acc, values| acc.saturating_mul(values.len() as u64))
    }

    /// Effective grid size limit.
    pub fn combination_limit(&self) -> u64 {
        self.max_combinations
            .unwrap_or(DEFAULT_MAX_COMBINATIONS)
            .min(MAX_COMBINATIONS_CEILING)
    }
}

fn error(code: &'static str, message: String) -> ValidationError {
    ValidationError::new(code).with_message(Cow::Owned(message))
}

fn check_window(timeframe: &str, start: &Timestamp, end: &Timestamp) -> Result<(), ValidationError> {
    if !SUPPORTED_TIMEFRAMES.contains(&timeframe) {
        return Err(error(
            "UNSUPPORTED_TIMEFRAME",
            format!("timeframe '{timeframe}' is not supported"),
        ));
    }
    if start >= end {
        return Err(error(
            "EMPTY_WINDOW",
            "start must be strictly before end".to_string(),
        ));
    }
    Ok(())
}

fn check_backtest(payload: &BacktestPayload) -> Result<(), ValidationError> {
    check_window(&payload.timeframe, &payload.start, &payload.end)
}

fn check_optimize(payload: &OptimizePayload) -> Result<(), ValidationError> {
    check_window(&payload.timeframe, &payload.start, &payload.end)?;

    let combinations = payload.combinations();
    if combinations == 0 {
        return Err(error(
            "EMPTY_GRID",
            "grid space produced no combinations".to_string(),
        ));
    }
    let limit = payload.combination_limit();
    if combinations > limit {
        return Err(error(
            "GRID_TOO_LARGE",
            format!("grid has {combinations} combinations, limit is {limit}"),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// JobPayload
// ---------------------------------------------------------------------------

/// A payload whose variant always matches the owning job's [`JobKind`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobPayload {
    Live(LivePayload),
    Paper(PaperPayload),
    Backtest(BacktestPayload),
    Optimize(OptimizePayload),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Live(_) => JobKind::Live,
            JobPayload::Paper(_) => JobKind::Paper,
            JobPayload::Backtest(_) => JobKind::Backtest,
            JobPayload::Optimize(_) => JobKind::Optimize,
        }
    }

    /// Parse raw JSON with the schema for `kind` and validate it.
    pub fn parse(kind: JobKind, raw: serde_json::Value) -> Result<Self, CoreError> {
        let payload = match kind {
            JobKind::Live => JobPayload::Live(decode(kind, raw)?),
            JobKind::Paper => JobPayload::Paper(decode(kind, raw)?),
            JobKind::Backtest => JobPayload::Backtest(decode(kind, raw)?),
            JobKind::Optimize => JobPayload::Optimize(decode(kind, raw)?),
        };
        payload.validate()?;
        Ok(payload)
    }

    /// Run the schema rules for the variant.
    pub fn validate(&self) -> Result<(), CoreError> {
        let result = match self {
            JobPayload::Live(p) => p.validate(),
            JobPayload::Paper(p) => p.validate(),
            JobPayload::Backtest(p) => p.validate(),
            JobPayload::Optimize(p) => p.validate(),
        };
        result.map_err(|e| CoreError::Validation(format!("invalid {} payload: {e}", self.kind())))
    }

    pub fn as_optimize(&self) -> Option<&OptimizePayload> {
        match self {
            JobPayload::Optimize(p) => Some(p),
            _ => None,
        }
    }
}

fn decode<T: DeserializeOwned>(kind: JobKind, raw: serde_json::Value) -> Result<T, CoreError> {
    serde_json::from_value(raw)
        .map_err(|e| CoreError::Validation(format!("invalid {kind} payload: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
