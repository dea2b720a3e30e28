use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::BacktestEngine;
use crate::error::BacktestError;
use crate::metrics::{compute_metrics, mean, percentile_sorted, stddev};
use crate::models::{BacktestConfig, Bar, PerformanceMetrics, SimulationResult};
use crate::resample::{
    block_bootstrap_series, bootstrap_series, equity_from_trades, parametric_series,
    shuffle_trades, ResampleMethod,
};
use crate::rng::SimRng;
use crate::strategy::Strategy;

/// Cooperative cancellation for long Monte Carlo loops. Checked between runs;
/// a fired token discards all partial aggregation.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Monte Carlo run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloConfig {
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    pub method: ResampleMethod,
    /// Each iteration seeds its generator with `base_seed ^ iteration`.
    #[serde(default = "default_base_seed")]
    pub base_seed: u64,
    /// Confidence level for the per-metric intervals.
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    /// Ruin = final equity below this fraction of initial capital.
    #[serde(default = "default_ruin_threshold")]
    pub ruin_threshold: f64,
    /// Total-return goals for the goal-probability map.
    #[serde(default)]
    pub goal_thresholds: Vec<f64>,
}

fn default_iterations() -> usize {
    1000
}
fn default_base_seed() -> u64 {
    42
}
fn default_confidence_level() -> f64 {
    0.95
}
fn default_ruin_threshold() -> f64 {
    0.5
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            method: ResampleMethod::TradeShuffle,
            base_seed: default_base_seed(),
            confidence_level: default_confidence_level(),
            ruin_threshold: default_ruin_threshold(),
            goal_thresholds: Vec::new(),
        }
    }
}

impl MonteCarloConfig {
    pub fn validate(&self) -> Result<(), BacktestError> {
        if self.iterations == 0 {
            return Err(BacktestError::InvalidConfig(
                "monte carlo iterations must be at least 1".to_string(),
            ));
        }
        if !self.confidence_level.is_finite()
            || self.confidence_level <= 0.0
            || self.confidence_level >= 1.0
        {
            return Err(BacktestError::InvalidConfig(
                "confidence_level must be in (0, 1)".to_string(),
            ));
        }
        if !self.ruin_threshold.is_finite()
            || self.ruin_threshold <= 0.0
            || self.ruin_threshold > 1.0
        {
            return Err(BacktestError::InvalidConfig(
                "ruin_threshold must be in (0, 1]".to_string(),
            ));
        }
        if let ResampleMethod::BlockBootstrap { block_size } = self.method {
            if block_size == 0 {
                return Err(BacktestError::InvalidConfig(
                    "block_size must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Distributional summary of one metric across runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct MetricDistribution {
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub p5: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GoalProbability {
    pub threshold: f64,
    pub probability: f64,
}

/// Cross-run risk figures over the total-return distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RiskAssessment {
    pub var_95: f64,
    pub var_99: f64,
    pub cvar_95: f64,
    pub cvar_99: f64,
    /// Fraction of runs ending below the ruin threshold.
    pub ruin_probability: f64,
    pub goal_probabilities: Vec<GoalProbability>,
}

/// Reference to one extreme run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct CaseReference {
    pub iteration: usize,
    pub total_return: f64,
    pub max_drawdown: f64,
}

/// Aggregate outcome of a Monte Carlo study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloSummary {
    pub iterations: usize,
    pub method: ResampleMethod,
    pub total_return: MetricDistribution,
    pub annualized_return: MetricDistribution,
    pub sharpe_ratio: MetricDistribution,
    pub sortino_ratio: MetricDistribution,
    pub max_drawdown: MetricDistribution,
    pub volatility: MetricDistribution,
    pub win_rate: MetricDistribution,
    /// Fraction of runs with positive total return.
    pub probability_of_profit: f64,
    /// Blend of return stability, profit probability and risk-adjusted
    /// return, in [0, 1].
    pub robustness_score: f64,
    pub risk: RiskAssessment,
    pub worst_case: CaseReference,
    pub best_case: CaseReference,
}

struct RunOutcome {
    metrics: PerformanceMetrics,
    final_equity: f64,
}

/// Monte Carlo over a completed simulation by trade shuffling.
///
/// Requires `method == TradeShuffle`; the data-resampling modes re-run the
/// simulator and live in [`run_monte_carlo_bars`].
pub fn run_monte_carlo(
    result: &SimulationResult,
    mc: &MonteCarloConfig,
    cancel: Option<&CancellationToken>,
) -> Result<MonteCarloSummary, BacktestError> {
    mc.validate()?;
    if mc.method != ResampleMethod::TradeShuffle {
        return Err(BacktestError::InvalidConfig(
            "data-resampling methods need a bar series; use run_monte_carlo_bars".to_string(),
        ));
    }
    debug!(iterations = mc.iterations, "starting trade-shuffle monte carlo");

    let outcomes: Result<Vec<RunOutcome>, BacktestError> = (0..mc.iterations)
        .into_par_iter()
        .map(|iteration| {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(BacktestError::Cancelled);
            }
            let mut rng = SimRng::for_iteration(mc.base_seed, iteration as u64);
            let shuffled = shuffle_trades(&result.trades, &mut rng);
            let curve = equity_from_trades(&shuffled, result.initial_capital);
            let metrics = compute_metrics(
                &shuffled,
                &curve,
                result.initial_capital,
                result.duration_days,
            );
            let final_equity = *curve.last().unwrap_or(&result.initial_capital);
            Ok(RunOutcome {
                metrics,
                final_equity,
            })
        })
        .collect();

    let outcomes = outcomes?;
    if cancel.is_some_and(CancellationToken::is_cancelled) {
        return Err(BacktestError::Cancelled);
    }
    Ok(aggregate(outcomes, mc, result.initial_capital))
}

/// Monte Carlo by data resampling: each iteration builds a synthetic bar
/// series and drives a fresh strategy from `strategy_factory` through the
/// full simulator.
pub fn run_monte_carlo_bars<S, F>(
    bars: &[Bar],
    strategy_factory: F,
    config: &BacktestConfig,
    mc: &MonteCarloConfig,
    cancel: Option<&CancellationToken>,
) -> Result<MonteCarloSummary, BacktestError>
where
    S: Strategy,
    F: Fn() -> S + Sync,
{
    mc.validate()?;
    config.validate()?;
    crate::models::validate_bar_series(bars)?;
    if mc.method == ResampleMethod::TradeShuffle {
        return Err(BacktestError::InvalidConfig(
            "trade shuffling works on a completed result; use run_monte_carlo".to_string(),
        ));
    }
    if mc.method == ResampleMethod::Parametric && bars.len() < crate::resample::MIN_PARAMETRIC_BARS
    {
        return Err(BacktestError::InsufficientData(format!(
            "parametric resampling needs at least {} bars",
            crate::resample::MIN_PARAMETRIC_BARS
        )));
    }
    debug!(
        iterations = mc.iterations,
        bars = bars.len(),
        "starting data-resampling monte carlo"
    );

    let engine = BacktestEngine::new(config.clone())?;
    let outcomes: Result<Vec<RunOutcome>, BacktestError> = (0..mc.iterations)
        .into_par_iter()
        .map(|iteration| {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(BacktestError::Cancelled);
            }
            let mut rng = SimRng::for_iteration(mc.base_seed, iteration as u64);
            let synthetic = match mc.method {
                ResampleMethod::Bootstrap => bootstrap_series(bars, &mut rng),
                ResampleMethod::BlockBootstrap { block_size } => {
                    block_bootstrap_series(bars, block_size, &mut rng)
                }
                ResampleMethod::Parametric => parametric_series(bars, &mut rng)?,
                ResampleMethod::TradeShuffle => unreachable!("rejected above"),
            };
            let mut strategy = strategy_factory();
            let result = engine.run(&mut strategy, &synthetic)?;
            Ok(RunOutcome {
                metrics: result.metrics,
                final_equity: result.final_equity,
            })
        })
        .collect();

    let outcomes = outcomes?;
    if cancel.is_some_and(CancellationToken::is_cancelled) {
        return Err(BacktestError::Cancelled);
    }
    Ok(aggregate(outcomes, mc, config.initial_capital))
}

fn aggregate(
    outcomes: Vec<RunOutcome>,
    mc: &MonteCarloConfig,
    initial_capital: f64,
) -> MonteCarloSummary {
    let dist = |extract: fn(&PerformanceMetrics) -> f64| -> MetricDistribution {
        let values: Vec<f64> = outcomes
            .iter()
            .map(|o| extract(&o.metrics))
            .filter(|v| v.is_finite())
            .collect();
        distribution(&values, mc.confidence_level)
    };

    let returns: Vec<f64> = outcomes.iter().map(|o| o.metrics.total_return).collect();
    let profitable = returns.iter().filter(|r| **r > 0.0).count();
    let probability_of_profit = profitable as f64 / returns.len().max(1) as f64;

    let sharpe_mean = mean(
        &outcomes
            .iter()
            .map(|o| o.metrics.sharpe_ratio)
            .filter(|v| v.is_finite())
            .collect::<Vec<f64>>(),
    );
    let ret_mean = mean(&returns);
    let ret_std = stddev(&returns, ret_mean);
    let stability = if ret_mean != 0.0 {
        1.0 - (ret_std / ret_mean).abs().min(1.0)
    } else {
        0.0
    };
    let sharpe_component = ((sharpe_mean + 2.0) / 4.0).clamp(0.0, 1.0);
    let robustness_score =
        0.3 * stability + 0.4 * probability_of_profit + 0.3 * sharpe_component;

    let mut sorted_returns = returns.clone();
    sorted_returns.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let p5 = percentile_sorted(&sorted_returns, 5.0);
    let p1 = percentile_sorted(&sorted_returns, 1.0);
    let tail_mean = |threshold: f64| {
        let tail: Vec<f64> = sorted_returns
            .iter()
            .copied()
            .filter(|r| *r <= threshold)
            .collect();
        mean(&tail)
    };
    let ruin_count = outcomes
        .iter()
        .filter(|o| o.final_equity < mc.ruin_threshold * initial_capital)
        .count();
    let goal_probabilities = mc
        .goal_thresholds
        .iter()
        .map(|&threshold| GoalProbability {
            threshold,
            probability: returns.iter().filter(|r| **r >= threshold).count() as f64
                / returns.len().max(1) as f64,
        })
        .collect();

    let risk = RiskAssessment {
        var_95: p5.abs(),
        var_99: p1.abs(),
        cvar_95: tail_mean(p5),
        cvar_99: tail_mean(p1),
        ruin_probability: ruin_count as f64 / outcomes.len().max(1) as f64,
        goal_probabilities,
    };

    let mut worst = CaseReference::default();
    let mut best = CaseReference::default();
    for (i, outcome) in outcomes.iter().enumerate() {
        let case = CaseReference {
            iteration: i,
            total_return: outcome.metrics.total_return,
            max_drawdown: outcome.metrics.max_drawdown,
        };
        if i == 0 || case.total_return < worst.total_return {
            worst = case;
        }
        if i == 0 || case.total_return > best.total_return {
            best = case;
        }
    }

    MonteCarloSummary {
        iterations: outcomes.len(),
        method: mc.method,
        total_return: dist(|m| m.total_return),
        annualized_return: dist(|m| m.annualized_return),
        sharpe_ratio: dist(|m| m.sharpe_ratio),
        sortino_ratio: dist(|m| m.sortino_ratio),
        max_drawdown: dist(|m| m.max_drawdown),
        volatility: dist(|m| m.volatility),
        win_rate: dist(|m| m.win_rate),
        probability_of_profit,
        robustness_score,
        risk,
        worst_case: worst,
        best_case: best,
    }
}

fn distribution(values: &[f64], confidence_level: f64) -> MetricDistribution {
    if values.is_empty() {
        return MetricDistribution::default();
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let m = mean(&sorted);
    let tail = (1.0 - confidence_level) / 2.0 * 100.0;
    MetricDistribution {
        mean: m,
        median: percentile_sorted(&sorted, 50.0),
        std_dev: stddev(&sorted, m),
        p5: percentile_sorted(&sorted, 5.0),
        p25: percentile_sorted(&sorted, 25.0),
        p50: percentile_sorted(&sorted, 50.0),
        p75: percentile_sorted(&sorted, 75.0),
        p95: percentile_sorted(&sorted, 95.0),
        ci_lower: percentile_sorted(&sorted, tail),
        ci_upper: percentile_sorted(&sorted, 100.0 - tail),
    }
}
