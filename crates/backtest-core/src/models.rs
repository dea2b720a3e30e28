use serde::{Deserialize, Serialize};

use crate::error::BacktestError;

/// A single OHLCV bar. Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Check the OHLC invariants for a single bar.
    pub fn validate(&self) -> Result<(), BacktestError> {
        let fields = [self.open, self.high, self.low, self.close];
        if fields.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(BacktestError::InvalidBarSeries(format!(
                "non-finite or non-positive price at timestamp {}",
                self.timestamp
            )));
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(BacktestError::InvalidBarSeries(format!(
                "invalid volume at timestamp {}",
                self.timestamp
            )));
        }
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        if self.low > body_low || self.high < body_high {
            return Err(BacktestError::InvalidBarSeries(format!(
                "OHLC invariant broken at timestamp {} (low {} high {} open {} close {})",
                self.timestamp, self.low, self.high, self.open, self.close
            )));
        }
        Ok(())
    }
}

/// Validate an ordered bar series: every bar well-formed, timestamps strictly
/// increasing, series non-empty.
pub fn validate_bar_series(bars: &[Bar]) -> Result<(), BacktestError> {
    if bars.is_empty() {
        return Err(BacktestError::InvalidBarSeries("empty series".to_string()));
    }
    for bar in bars {
        bar.validate()?;
    }
    for pair in bars.windows(2) {
        if pair[1].timestamp <= pair[0].timestamp {
            return Err(BacktestError::InvalidBarSeries(format!(
                "non-monotone timestamps: {} then {}",
                pair[0].timestamp, pair[1].timestamp
            )));
        }
    }
    Ok(())
}

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// The action a strategy emits for one bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyAction {
    Buy {
        quantity: Option<f64>,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    },
    Sell {
        quantity: Option<f64>,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    },
    Close,
    Hold,
}

impl StrategyAction {
    /// Shorthand for an unsized buy without protective levels.
    pub fn buy() -> Self {
        StrategyAction::Buy {
            quantity: None,
            stop_loss: None,
            take_profit: None,
        }
    }

    /// Shorthand for an unsized sell without protective levels.
    pub fn sell() -> Self {
        StrategyAction::Sell {
            quantity: None,
            stop_loss: None,
            take_profit: None,
        }
    }
}

/// The single open position tracked by the simulator. At most one position
/// exists at a time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Position {
    Flat,
    Long {
        entry_price: f64,
        entry_time: i64,
        quantity: f64,
        stop: Option<f64>,
        take_profit: Option<f64>,
    },
    Short {
        entry_price: f64,
        entry_time: i64,
        quantity: f64,
        stop: Option<f64>,
        take_profit: Option<f64>,
    },
}

impl Position {
    pub fn is_flat(&self) -> bool {
        matches!(self, Position::Flat)
    }

    /// Entry price of the open position, if any.
    pub fn entry_price(&self) -> Option<f64> {
        match self {
            Position::Flat => None,
            Position::Long { entry_price, .. } | Position::Short { entry_price, .. } => {
                Some(*entry_price)
            }
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Take-profit level reached within the bar.
    Target,
    /// Stop-loss level reached within the bar.
    Stop,
    /// The strategy asked to close or reverse.
    Signal,
    /// Forced liquidation: end of the bar stream or drawdown kill-switch.
    EndOfData,
}

/// Execution diagnostics recorded per trade (entry-side values).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct TradeDiagnostics {
    /// Market impact component of the entry slippage rate.
    pub market_impact: f64,
    /// Total entry slippage rate actually applied.
    pub effective_slippage: f64,
    /// Commission tier the entry fill landed in (None = base rate).
    pub commission_tier: Option<usize>,
    pub time_of_day_factor: f64,
    pub volatility_factor: f64,
}

/// A round-trip trade, created when a position closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub symbol: String,
    pub side: Side,
    pub entry_time: i64,
    pub exit_time: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    /// Net P&L after entry and exit commissions.
    pub pnl: f64,
    /// Net P&L as a fraction of the entry notional.
    pub pnl_pct: f64,
    /// Entry commission + exit commission.
    pub fees: f64,
    pub exit_reason: ExitReason,
    pub diagnostics: TradeDiagnostics,
}

// --- Configuration ---

/// One commission tier: the rate that applies once cumulative traded notional
/// reaches `cumulative_volume_threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommissionTier {
    pub cumulative_volume_threshold: f64,
    pub rate: f64,
}

/// Intraday session windows for the time-of-day slippage multiplier, in
/// minutes since local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionProfile {
    pub open_start_min: u32,
    pub open_end_min: u32,
    pub lunch_start_min: u32,
    pub lunch_end_min: u32,
    pub close_start_min: u32,
    pub close_end_min: u32,
    pub open_mult: f64,
    pub lunch_mult: f64,
    pub close_mult: f64,
}

impl Default for SessionProfile {
    fn default() -> Self {
        Self {
            // 09:30-10:30 open, 12:00-13:00 lunch, 15:30-16:00 close
            open_start_min: 570,
            open_end_min: 630,
            lunch_start_min: 720,
            lunch_end_min: 780,
            close_start_min: 930,
            close_end_min: 960,
            open_mult: 1.5,
            lunch_mult: 1.2,
            close_mult: 1.3,
        }
    }
}

/// Knobs for the realistic execution model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealisticCostConfig {
    /// Average daily volume in shares; market impact is skipped when unset.
    #[serde(default)]
    pub average_daily_volume: Option<f64>,
    /// Square-root impact coefficient (lambda).
    #[serde(default = "default_impact_coefficient")]
    pub market_impact_coefficient: f64,
    #[serde(default)]
    pub use_time_of_day: bool,
    #[serde(default)]
    pub session: SessionProfile,
    #[serde(default)]
    pub use_volatility_slippage: bool,
    /// Lookback for the rolling return stddev, in bars.
    #[serde(default = "default_volatility_window")]
    pub volatility_window: usize,
    #[serde(default = "default_volatility_multiplier")]
    pub volatility_multiplier: f64,
    #[serde(default)]
    pub use_tiered_commissions: bool,
    /// Tiers ordered by ascending cumulative notional threshold.
    #[serde(default)]
    pub commission_tiers: Vec<CommissionTier>,
    /// Assumed displayed depth; orders below `1/depth` participation get
    /// linearly scaled-down impact.
    #[serde(default = "default_order_book_depth")]
    pub order_book_depth: usize,
}

fn default_impact_coefficient() -> f64 {
    0.1
}
fn default_volatility_window() -> usize {
    20
}
fn default_volatility_multiplier() -> f64 {
    2.0
}
fn default_order_book_depth() -> usize {
    100
}

impl Default for RealisticCostConfig {
    fn default() -> Self {
        Self {
            average_daily_volume: None,
            market_impact_coefficient: default_impact_coefficient(),
            use_time_of_day: false,
            session: SessionProfile::default(),
            use_volatility_slippage: false,
            volatility_window: default_volatility_window(),
            volatility_multiplier: default_volatility_multiplier(),
            use_tiered_commissions: false,
            commission_tiers: Vec::new(),
            order_book_depth: default_order_book_depth(),
        }
    }
}

/// The active execution model. `Simple` applies only the flat commission and
/// slippage rates; `Realistic` layers impact, session and volatility effects
/// and tiered commissions on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum CostModelConfig {
    Simple,
    Realistic(RealisticCostConfig),
}

impl Default for CostModelConfig {
    fn default() -> Self {
        CostModelConfig::Simple
    }
}

/// Configuration for a backtest run. All rates are fractions (0.01 = 1%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub symbol: String,
    pub initial_capital: f64,
    #[serde(default = "default_commission_rate")]
    pub commission_rate: f64,
    #[serde(default = "default_slippage_rate")]
    pub slippage_rate: f64,
    /// Full quoted spread as a fraction of price; half is paid per side.
    #[serde(default)]
    pub spread: f64,
    /// Cap on position notional as a fraction of equity, also the default
    /// sizing when an action carries no explicit quantity.
    #[serde(default = "default_max_position_size_pct")]
    pub max_position_size_pct: f64,
    /// Drawdown kill-switch as a fraction of peak equity. None = disabled.
    #[serde(default)]
    pub max_drawdown_pct: Option<f64>,
    #[serde(default)]
    pub allow_short: bool,
    #[serde(default = "default_true")]
    pub use_stop_loss: bool,
    #[serde(default = "default_true")]
    pub use_take_profit: bool,
    /// Bars skipped before the strategy is first invoked.
    #[serde(default = "default_warmup_bars")]
    pub warmup_bars: usize,
    #[serde(default)]
    pub cost_model: CostModelConfig,
}

fn default_commission_rate() -> f64 {
    0.001
}
fn default_slippage_rate() -> f64 {
    0.0005
}
fn default_max_position_size_pct() -> f64 {
    0.5
}
fn default_warmup_bars() -> usize {
    50
}
fn default_true() -> bool {
    true
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            initial_capital: 100_000.0,
            commission_rate: default_commission_rate(),
            slippage_rate: default_slippage_rate(),
            spread: 0.0,
            max_position_size_pct: default_max_position_size_pct(),
            max_drawdown_pct: None,
            allow_short: false,
            use_stop_loss: true,
            use_take_profit: true,
            warmup_bars: default_warmup_bars(),
            cost_model: CostModelConfig::Simple,
        }
    }
}

impl BacktestConfig {
    /// Validate every numeric parameter against its documented range.
    pub fn validate(&self) -> Result<(), BacktestError> {
        let rate_ok = |v: f64| v.is_finite() && (0.0..1.0).contains(&v);
        if !self.initial_capital.is_finite() || self.initial_capital <= 0.0 {
            return Err(BacktestError::InvalidConfig(
                "initial_capital must be positive and finite".to_string(),
            ));
        }
        if !rate_ok(self.commission_rate) {
            return Err(BacktestError::InvalidConfig(
                "commission_rate must be in [0, 1)".to_string(),
            ));
        }
        if !rate_ok(self.slippage_rate) {
            return Err(BacktestError::InvalidConfig(
                "slippage_rate must be in [0, 1)".to_string(),
            ));
        }
        if !rate_ok(self.spread) {
            return Err(BacktestError::InvalidConfig(
                "spread must be in [0, 1)".to_string(),
            ));
        }
        if !self.max_position_size_pct.is_finite()
            || self.max_position_size_pct <= 0.0
            || self.max_position_size_pct > 1.0
        {
            return Err(BacktestError::InvalidConfig(
                "max_position_size_pct must be in (0, 1]".to_string(),
            ));
        }
        if let Some(dd) = self.max_drawdown_pct {
            if !dd.is_finite() || dd <= 0.0 || dd >= 1.0 {
                return Err(BacktestError::InvalidConfig(
                    "max_drawdown_pct must be in (0, 1)".to_string(),
                ));
            }
        }
        if let CostModelConfig::Realistic(ref realistic) = self.cost_model {
            realistic.validate()?;
        }
        Ok(())
    }
}

impl RealisticCostConfig {
    pub fn validate(&self) -> Result<(), BacktestError> {
        if let Some(adv) = self.average_daily_volume {
            if !adv.is_finite() || adv <= 0.0 {
                return Err(BacktestError::InvalidConfig(
                    "average_daily_volume must be positive and finite".to_string(),
                ));
            }
        }
        if !self.market_impact_coefficient.is_finite() || self.market_impact_coefficient < 0.0 {
            return Err(BacktestError::InvalidConfig(
                "market_impact_coefficient must be non-negative".to_string(),
            ));
        }
        if self.use_volatility_slippage && self.volatility_window < 2 {
            return Err(BacktestError::InvalidConfig(
                "volatility_window must be at least 2 bars".to_string(),
            ));
        }
        if !self.volatility_multiplier.is_finite() || self.volatility_multiplier < 0.0 {
            return Err(BacktestError::InvalidConfig(
                "volatility_multiplier must be non-negative".to_string(),
            ));
        }
        if self.order_book_depth == 0 {
            return Err(BacktestError::InvalidConfig(
                "order_book_depth must be at least 1".to_string(),
            ));
        }
        if self.use_tiered_commissions {
            if self.commission_tiers.is_empty() {
                return Err(BacktestError::InvalidConfig(
                    "commission_tiers is empty with tiered commissions enabled".to_string(),
                ));
            }
            for tier in &self.commission_tiers {
                if !tier.cumulative_volume_threshold.is_finite()
                    || tier.cumulative_volume_threshold < 0.0
                    || !tier.rate.is_finite()
                    || !(0.0..1.0).contains(&tier.rate)
                {
                    return Err(BacktestError::InvalidConfig(
                        "commission tier out of range".to_string(),
                    ));
                }
            }
            let sorted = self
                .commission_tiers
                .windows(2)
                .all(|w| w[0].cumulative_volume_threshold < w[1].cumulative_volume_threshold);
            if !sorted {
                return Err(BacktestError::InvalidConfig(
                    "commission_tiers must be strictly ascending by threshold".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// --- Results ---

/// Scalar performance statistics from one run. Returns, drawdowns and rates
/// are fractions; `profit_factor` and `omega_ratio` may be `+inf` when the
/// run had gains and no losses, every other field is finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub annualized_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub omega_ratio: f64,
    pub max_drawdown: f64,
    /// Bars from the running peak to the deepest trough.
    pub max_drawdown_duration: usize,
    pub avg_drawdown: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub average_win: f64,
    pub average_loss: f64,
    pub average_trade: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub max_consecutive_wins: u32,
    pub max_consecutive_losses: u32,
    /// Magnitude of the 5th percentile of per-bar returns.
    pub var_95: f64,
    /// Magnitude of the 1st percentile of per-bar returns.
    pub var_99: f64,
    /// Mean of the per-bar returns at or below the 5th-percentile threshold
    /// (signed; typically negative).
    pub cvar_95: f64,
    pub skewness: f64,
    /// Excess kurtosis.
    pub kurtosis: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
}

/// Aggregate transaction costs across a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct TransactionCostSummary {
    /// Sum of all commissions paid.
    pub total_commission: f64,
    /// Sum over fills of |executed - reference| * quantity.
    pub total_slippage_cost: f64,
    pub fills: usize,
}

/// Fill-level execution quality aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecutionQuality {
    pub avg_slippage_rate: f64,
    pub max_slippage_rate: f64,
    pub avg_market_impact: f64,
    pub avg_time_of_day_factor: f64,
    pub avg_volatility_factor: f64,
    /// Mean order participation (order shares / ADV) when impact is modeled.
    pub avg_participation: f64,
}

/// Everything a completed run hands back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub trades: Vec<Trade>,
    /// First value = initial capital, then one value per post-warm-up bar.
    pub equity_curve: Vec<f64>,
    pub metrics: PerformanceMetrics,
    pub transaction_costs: TransactionCostSummary,
    pub execution_quality: ExecutionQuality,
    pub initial_capital: f64,
    pub final_equity: f64,
    /// Calendar span of the processed bars, in days.
    pub duration_days: f64,
}
