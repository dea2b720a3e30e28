use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::BacktestEngine;
use crate::error::BacktestError;
use crate::models::{BacktestConfig, Bar, PerformanceMetrics};
use crate::overfitting::{
    analyze_overfitting, ComplexityDescriptor, OverfittingReport, ParameterSet,
};
use crate::statistical::{deflated_sharpe_ratio, DeflatedSharpe};
use crate::strategy::Strategy;

/// One (train-window, test-window) outcome pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardSlice {
    pub in_sample: PerformanceMetrics,
    pub out_of_sample: PerformanceMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardConfig {
    /// Number of rolling windows. Each window splits into train and test.
    #[serde(default = "default_num_slices")]
    pub num_slices: usize,
    /// Fraction of each window used for training.
    #[serde(default = "default_train_fraction")]
    pub train_fraction: f64,
}

fn default_num_slices() -> usize {
    5
}
fn default_train_fraction() -> f64 {
    0.7
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            num_slices: default_num_slices(),
            train_fraction: default_train_fraction(),
        }
    }
}

impl WalkForwardConfig {
    pub fn validate(&self) -> Result<(), BacktestError> {
        if self.num_slices < 2 {
            return Err(BacktestError::InsufficientData(
                "walk-forward needs at least 2 slices".to_string(),
            ));
        }
        if !self.train_fraction.is_finite()
            || self.train_fraction <= 0.0
            || self.train_fraction >= 1.0
        {
            return Err(BacktestError::InvalidConfig(
                "train_fraction must be in (0, 1)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Roll (train, test) windows over the series and run the simulator on each,
/// producing one metric pair per window. A fresh strategy comes from
/// `strategy_factory` for every sub-run.
pub fn run_walk_forward<S, F>(
    bars: &[Bar],
    strategy_factory: F,
    config: &BacktestConfig,
    wf: &WalkForwardConfig,
) -> Result<Vec<WalkForwardSlice>, BacktestError>
where
    S: Strategy,
    F: Fn() -> S,
{
    wf.validate()?;
    crate::models::validate_bar_series(bars)?;
    let window = bars.len() / wf.num_slices;
    let train_len = (window as f64 * wf.train_fraction) as usize;
    let test_len = window.saturating_sub(train_len);
    if train_len < 2 || test_len < 2 {
        return Err(BacktestError::InsufficientData(format!(
            "{} bars cannot fill {} walk-forward slices",
            bars.len(),
            wf.num_slices
        )));
    }
    debug!(
        slices = wf.num_slices,
        window, train_len, test_len, "running walk-forward evaluation"
    );

    let engine = BacktestEngine::new(config.clone())?;
    let mut slices = Vec::with_capacity(wf.num_slices);
    for i in 0..wf.num_slices {
        let start = i * window;
        let train = &bars[start..start + train_len];
        let test = &bars[start + train_len..start + window];

        let mut train_strategy = strategy_factory();
        let in_sample = engine.run(&mut train_strategy, train)?.metrics;
        let mut test_strategy = strategy_factory();
        let out_of_sample = engine.run(&mut test_strategy, test)?.metrics;

        slices.push(WalkForwardSlice {
            in_sample,
            out_of_sample,
        });
    }
    Ok(slices)
}

/// A named candidate for cross-strategy comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyCandidate {
    pub name: String,
    pub in_sample: PerformanceMetrics,
    pub out_of_sample: PerformanceMetrics,
    #[serde(default)]
    pub walk_forward: Option<Vec<WalkForwardSlice>>,
    #[serde(default)]
    pub parameters: Option<ParameterSet>,
    #[serde(default)]
    pub complexity: Option<ComplexityDescriptor>,
}

/// One entry of the ranked comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRanking {
    /// 1-based rank, best first.
    pub rank: usize,
    pub name: String,
    /// Ranking score: out-of-sample Sharpe minus the overfitting score.
    pub score: f64,
    pub out_of_sample_sharpe: f64,
    /// Out-of-sample Sharpe deflated for having been picked among all the
    /// candidates in this comparison.
    pub sharpe_deflation: DeflatedSharpe,
    pub overfitting: OverfittingReport,
}

/// Rank candidates by out-of-sample Sharpe penalized by their overfitting
/// score; every entry carries its full overfit verdict.
pub fn compare_strategies(candidates: &[StrategyCandidate]) -> Vec<StrategyRanking> {
    let mut rankings: Vec<StrategyRanking> = candidates
        .iter()
        .map(|c| {
            let report = analyze_overfitting(
                &c.in_sample,
                &c.out_of_sample,
                c.walk_forward.as_deref(),
                c.parameters.as_ref(),
                c.complexity.as_ref(),
            );
            // Deflation works on the per-bar Sharpe; every candidate in the
            // comparison counts as one selection trial.
            let per_bar_sharpe = c.out_of_sample.sharpe_ratio / 252.0_f64.sqrt();
            let sharpe_deflation = deflated_sharpe_ratio(
                per_bar_sharpe,
                candidates.len(),
                c.out_of_sample.total_trades,
                c.out_of_sample.skewness,
                c.out_of_sample.kurtosis,
            );
            StrategyRanking {
                rank: 0,
                name: c.name.clone(),
                score: c.out_of_sample.sharpe_ratio - report.score,
                out_of_sample_sharpe: c.out_of_sample.sharpe_ratio,
                sharpe_deflation,
                overfitting: report,
            }
        })
        .collect();
    rankings.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    for (i, entry) in rankings.iter_mut().enumerate() {
        entry.rank = i + 1;
    }
    rankings
}
