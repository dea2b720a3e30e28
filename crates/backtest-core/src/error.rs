use thiserror::Error;

/// Error taxonomy for the backtest core.
///
/// Every operation either produces a complete result or fails with one of
/// these variants; the core never logs-and-continues. Degenerate but legal
/// inputs (zero trades, flat equity) are not errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BacktestError {
    /// A numeric parameter is outside its documented range, or the commission
    /// tier list is unsorted/empty while tiered commissions are enabled.
    /// Detected at construction; no run begins.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Non-finite field, broken OHLC invariant, non-monotone timestamps, or
    /// a series shorter than the warm-up requires. Detected before the run.
    #[error("invalid bar series: {0}")]
    InvalidBarSeries(String),

    /// A strategy returned an action the engine cannot honor (non-finite
    /// quantity or stop/take, short when shorts are disabled, size beyond the
    /// position cap). The run aborts and partial results are discarded.
    #[error("invalid strategy action at bar {index}: {reason}")]
    InvalidStrategyAction { index: usize, reason: String },

    /// Too little data for the requested operation (parametric resampling,
    /// walk-forward slicing).
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Cooperative cancellation fired between Monte Carlo runs.
    #[error("operation cancelled")]
    Cancelled,
}
