//! Simulated job handlers wired into the binary.
//!
//! Real exchange sessions and strategy engines live outside this service.
//! These stand-ins pace themselves with `tokio::time::sleep`, honor
//! cancellation between steps and, for optimize jobs, stream progress the
//! same way a real grid search would.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use quantgate_core::job::JobKind;
use quantgate_core::payload::{JobPayload, Objective};
use quantgate_events::OptimizationEvent;
use quantgate_worker::{HandlerError, HandlerRegistry, JobContext, JobHandler};

/// Timings for the simulated workloads.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Pause between live/paper session ticks.
    pub session_tick: Duration,
    /// Ticks in one live/paper session.
    pub session_ticks: u32,
    /// Pause per batch of replayed candles.
    pub backtest_batch: Duration,
    /// Pause per grid evaluation.
    pub evaluation: Duration,
    /// Evaluations without improvement before an early stop.
    pub patience: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            session_tick: Duration::from_millis(200),
            session_ticks: 25,
            backtest_batch: Duration::from_millis(10),
            evaluation: Duration::from_millis(20),
            patience: 25,
        }
    }
}

/// Candles replayed between pauses.
const CANDLES_PER_BATCH: u64 = 500;

/// Register a simulated handler for every [`JobKind`].
pub fn simulated_registry(config: WorkloadConfig) -> HandlerRegistry {
    HandlerRegistry::new()
        .register(JobKind::Live, SessionWorkload::new(&config))
        .register(JobKind::Paper, SessionWorkload::new(&config))
        .register(
            JobKind::Backtest,
            BacktestWorkload {
                batch: config.backtest_batch,
            },
        )
        .register(
            JobKind::Optimize,
            GridSearchWorkload {
                evaluation: config.evaluation,
                patience: config.patience,
            },
        )
}

/// Sleep for `pause`, or fail with [`HandlerError::Canceled`] if the job is
/// canceled first.
async fn step(ctx: &JobContext, pause: Duration) -> Result<(), HandlerError> {
    tokio::select! {
        _ = ctx.cancelled() => Err(HandlerError::Canceled),
        _ = tokio::time::sleep(pause) => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Live / paper sessions
// ---------------------------------------------------------------------------

struct SessionWorkload {
    tick: Duration,
    ticks: u32,
}

impl SessionWorkload {
    fn new(config: &WorkloadConfig) -> Self {
        Self {
            tick: config.session_tick,
            ticks: config.session_ticks,
        }
    }
}

#[async_trait]
impl JobHandler for SessionWorkload {
    async fn run(&self, ctx: JobContext) -> Result<(), HandlerError> {
        let (strategy, symbol) = match &ctx.job.payload {
            JobPayload::Live(p) => (&p.strategy_id, &p.symbol),
            JobPayload::Paper(p) => (&p.strategy_id, &p.symbol),
            other => {
                return Err(HandlerError::failed(format!(
                    "session handler got a {} payload",
                    other.kind()
                )))
            }
        };
        tracing::debug!(job_id = %ctx.job.id, %strategy, %symbol, "Session started");

        for _ in 0..self.ticks {
            step(&ctx, self.tick).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Backtest
// ---------------------------------------------------------------------------

struct BacktestWorkload {
    batch: Duration,
}

/// Minutes per candle for a supported timeframe.
fn timeframe_minutes(timeframe: &str) -> Option<i64> {
    match timeframe {
        "1m" => Some(1),
        "5m" => Some(5),
        "15m" => Some(15),
        "30m" => Some(30),
        "1h" => Some(60),
        "4h" => Some(240),
        "1d" => Some(1440),
        _ => None,
    }
}

/// Candles covered by a `[start, end)` window.
fn candle_count(
    timeframe: &str,
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
) -> Option<u64> {
    let minutes = timeframe_minutes(timeframe)?;
    let span = (end - start).num_minutes().max(0);
    Some((span / minutes) as u64)
}

#[async_trait]
impl JobHandler for BacktestWorkload {
    async fn run(&self, ctx: JobContext) -> Result<(), HandlerError> {
        let JobPayload::Backtest(payload) = &ctx.job.payload else {
            return Err(HandlerError::failed("backtest handler got a non-backtest payload"));
        };
        let candles = candle_count(&payload.timeframe, payload.start, payload.end)
            .ok_or_else(|| {
                HandlerError::failed(format!("unsupported timeframe {}", payload.timeframe))
            })?;

        let batches = candles.div_ceil(CANDLES_PER_BATCH);
        for _ in 0..batches {
            step(&ctx, self.batch).await?;
        }

        tracing::debug!(
            job_id = %ctx.job.id,
            strategy = %payload.strategy_id,
            candles,
            "Backtest replay finished",
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Grid search
// ---------------------------------------------------------------------------

struct GridSearchWorkload {
    evaluation: Duration,
    patience: u64,
}

/// Every combination of the parameter space, in lexicographic order of
/// parameter name then candidate index.
fn expand_grid(space: &BTreeMap<String, Vec<f64>>) -> Vec<BTreeMap<String, f64>> {
    let mut grid = vec![BTreeMap::new()];
    for (name, values) in space {
        grid = grid
            .into_iter()
            .flat_map(|partial| {
                values.iter().map(move |value| {
                    let mut point = partial.clone();
                    point.insert(name.clone(), *value);
                    point
                })
            })
            .collect();
    }
    grid
}

/// Deterministic synthetic score for a grid point.
fn score(objective: Objective, params: &BTreeMap<String, f64>) -> f64 {
    let seed = params
        .iter()
        .enumerate()
        .map(|(i, (_, v))| v * (12.9898 + i as f64 * 78.233))
        .sum::<f64>();
    let unit = ((seed.sin() * 43_758.545_3).fract()).abs();
    match objective {
        Objective::Sharpe => unit * 4.0 - 1.0,
        Objective::Pnl => unit * 6_000.0 - 1_000.0,
        Objective::WinRate => 0.3 + unit * 0.4,
    }
}

#[async_trait]
impl JobHandler for GridSearchWorkload {
    async fn run(&self, ctx: JobContext) -> Result<(), HandlerError> {
        let Some(payload) = ctx.job.payload.as_optimize() else {
            return Err(HandlerError::failed("optimize handler got a non-optimize payload"));
        };

        let mut best: Option<(BTreeMap<String, f64>, f64)> = None;
        let mut since_improvement = 0u64;
        let mut evaluations = 0u64;

        for (index, params) in expand_grid(&payload.space).into_iter().enumerate() {
            step(&ctx, self.evaluation).await?;

            let value = score(payload.objective, &params);
            evaluations += 1;
            ctx.emit(OptimizationEvent::Evaluation {
                index: index as u64,
                params: params.clone(),
                score: value,
            })
            .await;

            match &best {
                Some((_, top)) if value <= *top => since_improvement += 1,
                _ => {
                    best = Some((params, value));
                    since_improvement = 0;
                }
            }

            if payload.early_stop && since_improvement >= self.patience {
                tracing::info!(job_id = %ctx.job.id, evaluations, "Grid search stopped early");
                ctx.emit(OptimizationEvent::EarlyStop {
                    evaluations,
                    reason: format!("no improvement in {} evaluations", self.patience),
                })
                .await;
                return Ok(());
            }
        }

        let Some((best_params, best_score)) = best else {
            let message = "grid produced no combinations".to_string();
            ctx.emit(OptimizationEvent::Error {
                message: message.clone(),
            })
            .await;
            return Err(HandlerError::Failed(message));
        };

        ctx.emit(OptimizationEvent::Completed {
            evaluations,
            best_params,
            best_score,
        })
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_expands_cartesian_product() {
        let space = BTreeMap::from([
            ("fast".to_string(), vec![5.0, 10.0]),
            ("slow".to_string(), vec![20.0, 30.0, 40.0]),
        ]);
        let grid = expand_grid(&space);
        assert_eq!(grid.len(), 6);
        assert_eq!(grid[0]["fast"], 5.0);
        assert_eq!(grid[0]["slow"], 20.0);
        assert_eq!(grid[5]["fast"], 10.0);
        assert_eq!(grid[5]["slow"], 40.0);
    }

    #[test]
    fn score_is_deterministic_and_bounded() {
        let params = BTreeMap::from([("fast".to_string(), 12.0)]);
        let a = score(Objective::WinRate, &params);
        let b = score(Objective::WinRate, &params);
        assert_eq!(a, b);
        assert!((0.3..=0.7).contains(&a));
    }

    #[test]
    fn candle_count_uses_timeframe() {
        let start = "2024-01-01T00:00:00Z".parse().unwrap();
        let end = "2024-01-02T00:00:00Z".parse().unwrap();
        assert_eq!(candle_count("1h", start, end), Some(24));
        assert_eq!(candle_count("1d", start, end), Some(1));
        assert_eq!(candle_count("2h", start, end), None);
    }
}
