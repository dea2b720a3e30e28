pub mod cost;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod models;
pub mod monte_carlo;
pub mod overfitting;
pub mod resample;
pub mod rng;
pub mod statistical;
pub mod strategy;
pub mod trade_analysis;
pub mod walk_forward;

#[cfg(test)]
mod tests;

pub use engine::{simulate, BacktestEngine};
pub use error::BacktestError;
pub use models::*;
pub use monte_carlo::{
    run_monte_carlo, run_monte_carlo_bars, CancellationToken, MonteCarloConfig, MonteCarloSummary,
};
pub use overfitting::{analyze_overfitting, EarlyStopMonitor, OverfittingReport};
pub use resample::ResampleMethod;
pub use strategy::{BacktestObserver, Strategy, StrategyContext};
pub use trade_analysis::{compute_expectancy, compute_streaks};
pub use walk_forward::{compare_strategies, run_walk_forward, WalkForwardConfig, WalkForwardSlice};
