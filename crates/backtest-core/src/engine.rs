use tracing::{debug, warn};

use crate::cost::{CostModel, Fill, FillKind};
use crate::error::BacktestError;
use crate::metrics::compute_metrics;
use crate::models::*;
use crate::strategy::{BacktestObserver, NullObserver, Strategy, StrategyContext};

const MS_PER_DAY: f64 = 86_400_000.0;

/// Entry-side state kept alongside the open position until it closes.
#[derive(Debug, Clone, Copy)]
struct EntryMeta {
    commission: f64,
    diagnostics: TradeDiagnostics,
}

/// Bar-driven backtest simulator. Single-threaded and deterministic: the same
/// bars, strategy and config always produce the same trade log and equity
/// curve.
pub struct BacktestEngine {
    config: BacktestConfig,
}

impl BacktestEngine {
    /// Construct an engine, validating the config up front. No run begins on
    /// an invalid config.
    pub fn new(config: BacktestConfig) -> Result<Self, BacktestError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Run the strategy over the bar series.
    pub fn run<S: Strategy + ?Sized>(
        &self,
        strategy: &mut S,
        bars: &[Bar],
    ) -> Result<SimulationResult, BacktestError> {
        self.run_with_observer(strategy, bars, &mut NullObserver)
    }

    /// Run with a typed lifecycle observer receiving every closed trade and
    /// the completed result.
    pub fn run_with_observer<S: Strategy + ?Sized>(
        &self,
        strategy: &mut S,
        bars: &[Bar],
        observer: &mut dyn BacktestObserver,
    ) -> Result<SimulationResult, BacktestError> {
        validate_bar_series(bars)?;
        debug!(bars = bars.len(), symbol = %self.config.symbol, "starting backtest run");

        let mut run = RunState::new(&self.config, bars.len());
        strategy.on_init();

        let mut last_index = 0usize;
        for (index, bar) in bars.iter().enumerate() {
            last_index = index;

            // 1. Protective exits against this bar's range, stop before target.
            if let Some((level, reason)) = run.protective_exit(bar) {
                run.close_position(level, reason, bar, bars, index, observer);
            }

            // 2-3. Strategy decision, applied through the cost model.
            if index >= self.config.warmup_bars {
                let ctx = StrategyContext {
                    bars: &bars[..=index],
                    index,
                    position: &run.position,
                    entry_price: run.position.entry_price(),
                    equity: run.equity,
                };
                let action = strategy.on_bar(&ctx);
                run.apply_action(action, bar, bars, index, observer)?;
            }

            // 5. Drawdown kill-switch: liquidate at this bar's close and stop.
            run.peak_equity = run.peak_equity.max(run.equity);
            let tripped = self.config.max_drawdown_pct.is_some_and(|limit| {
                (run.peak_equity - run.equity) / run.peak_equity > limit
            });
            if tripped {
                if !run.position.is_flat() {
                    run.close_position(bar.close, ExitReason::EndOfData, bar, bars, index, observer);
                }
                if index >= self.config.warmup_bars {
                    run.equity_curve.push(run.equity);
                }
                warn!(
                    index,
                    equity = run.equity,
                    "drawdown kill-switch tripped, halting run"
                );
                break;
            }

            // 4. Exactly one equity value per post-warm-up bar.
            if index >= self.config.warmup_bars {
                run.equity_curve.push(run.equity);
            }
        }

        // End of data: close whatever is still open at the last processed
        // close; the final equity value reflects the liquidation.
        if !run.position.is_flat() {
            let bar = &bars[last_index];
            run.close_position(bar.close, ExitReason::EndOfData, bar, bars, last_index, observer);
            let len = run.equity_curve.len();
            if len > 1 {
                run.equity_curve[len - 1] = run.equity;
            }
        }

        let duration_days = (bars[last_index].timestamp - bars[0].timestamp) as f64 / MS_PER_DAY;
        let result = run.into_result(&self.config, duration_days);
        strategy.on_end(&result);
        observer.on_run_complete(&result);
        debug!(
            trades = result.trades.len(),
            final_equity = result.final_equity,
            "backtest run complete"
        );
        Ok(result)
    }
}

/// Convenience wrapper: validate, construct, run.
pub fn simulate<S: Strategy + ?Sized>(
    strategy: &mut S,
    bars: &[Bar],
    config: &BacktestConfig,
) -> Result<SimulationResult, BacktestError> {
    BacktestEngine::new(config.clone())?.run(strategy, bars)
}

/// Mutable state owned by one run. Ownership of the trade log and equity
/// curve transfers to the caller through `into_result`.
struct RunState<'c> {
    config: &'c BacktestConfig,
    cost: CostModel,
    position: Position,
    entry_meta: Option<EntryMeta>,
    equity: f64,
    peak_equity: f64,
    trades: Vec<Trade>,
    equity_curve: Vec<f64>,
    next_trade_id: u64,
    total_commission: f64,
    total_slippage_cost: f64,
    fill_count: usize,
    sum_slippage_rate: f64,
    max_slippage_rate: f64,
    sum_market_impact: f64,
    sum_time_of_day: f64,
    sum_volatility: f64,
    sum_participation: f64,
}

impl<'c> RunState<'c> {
    fn new(config: &'c BacktestConfig, bar_count: usize) -> Self {
        Self {
            config,
            cost: CostModel::new(config, bar_count),
            position: Position::Flat,
            entry_meta: None,
            equity: config.initial_capital,
            peak_equity: config.initial_capital,
            trades: Vec::new(),
            equity_curve: vec![config.initial_capital],
            next_trade_id: 1,
            total_commission: 0.0,
            total_slippage_cost: 0.0,
            fill_count: 0,
            sum_slippage_rate: 0.0,
            max_slippage_rate: 0.0,
            sum_market_impact: 0.0,
            sum_time_of_day: 0.0,
            sum_volatility: 0.0,
            sum_participation: 0.0,
        }
    }

    /// Stop/take level hit within the current bar, if any. The stop is
    /// checked before the target when both lie inside the bar.
    fn protective_exit(&self, bar: &Bar) -> Option<(f64, ExitReason)> {
        match self.position {
            Position::Long {
                stop, take_profit, ..
            } => {
                if self.config.use_stop_loss {
                    if let Some(stop) = stop {
                        if bar.low <= stop {
                            return Some((stop, ExitReason::Stop));
                        }
                    }
                }
                if self.config.use_take_profit {
                    if let Some(take) = take_profit {
                        if bar.high >= take {
                            return Some((take, ExitReason::Target));
                        }
                    }
                }
                None
            }
            Position::Short {
                stop, take_profit, ..
            } => {
                if self.config.use_stop_loss {
                    if let Some(stop) = stop {
                        if bar.high >= stop {
                            return Some((stop, ExitReason::Stop));
                        }
                    }
                }
                if self.config.use_take_profit {
                    if let Some(take) = take_profit {
                        if bar.low <= take {
                            return Some((take, ExitReason::Target));
                        }
                    }
                }
                None
            }
            Position::Flat => None,
        }
    }

    fn apply_action(
        &mut self,
        action: StrategyAction,
        bar: &Bar,
        bars: &[Bar],
        index: usize,
        observer: &mut dyn BacktestObserver,
    ) -> Result<(), BacktestError> {
        validate_action(&action, index)?;
        match (self.position, action) {
            (_, StrategyAction::Hold) => {}
            (Position::Flat, StrategyAction::Close) => {}
            (
                Position::Flat,
                StrategyAction::Buy {
                    quantity,
                    stop_loss,
                    take_profit,
                },
            ) => {
                self.open(Side::Buy, quantity, stop_loss, take_profit, bar, bars, index)?;
            }
            (
                Position::Flat,
                StrategyAction::Sell {
                    quantity,
                    stop_loss,
                    take_profit,
                },
            ) => {
                if !self.config.allow_short {
                    return Err(BacktestError::InvalidStrategyAction {
                        index,
                        reason: "sell with no open position while shorting is disabled"
                            .to_string(),
                    });
                }
                self.open(Side::Sell, quantity, stop_loss, take_profit, bar, bars, index)?;
            }
            (Position::Long { .. }, StrategyAction::Close)
            | (Position::Short { .. }, StrategyAction::Close) => {
                self.close_position(bar.close, ExitReason::Signal, bar, bars, index, observer);
            }
            (
                Position::Long { .. },
                StrategyAction::Sell {
                    quantity,
                    stop_loss,
                    take_profit,
                },
            ) => {
                self.close_position(bar.close, ExitReason::Signal, bar, bars, index, observer);
                if self.config.allow_short {
                    self.open(Side::Sell, quantity, stop_loss, take_profit, bar, bars, index)?;
                }
            }
            (
                Position::Short { .. },
                StrategyAction::Buy {
                    quantity,
                    stop_loss,
                    take_profit,
                },
            ) => {
                self.close_position(bar.close, ExitReason::Signal, bar, bars, index, observer);
                self.open(Side::Buy, quantity, stop_loss, take_profit, bar, bars, index)?;
            }
            // Adding to an open position is not supported; the action is a no-op.
            (Position::Long { .. }, StrategyAction::Buy { .. })
            | (Position::Short { .. }, StrategyAction::Sell { .. }) => {}
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn open(
        &mut self,
        side: Side,
        quantity: Option<f64>,
        stop: Option<f64>,
        take_profit: Option<f64>,
        bar: &Bar,
        bars: &[Bar],
        index: usize,
    ) -> Result<(), BacktestError> {
        let cap = self.equity * self.config.max_position_size_pct;
        let quantity = match quantity {
            Some(q) => {
                let executed = self.cost.preview_price(bar.close, side, q, bars, index);
                if q * executed > cap * (1.0 + 1e-9) {
                    return Err(BacktestError::InvalidStrategyAction {
                        index,
                        reason: format!(
                            "quantity {q} exceeds max position notional {cap:.2} at the executed price"
                        ),
                    });
                }
                q
            }
            None => {
                // A provisional fill quoted at the close-price estimate
                // resolves the price/quantity circularity of impact-aware
                // fills; slippage moves the price against the order, so the
                // realized notional stays at or below the cap.
                let estimate = (cap / bar.close).floor();
                if estimate < 1.0 {
                    // Cannot afford a single share; nothing to open.
                    return Ok(());
                }
                let executed = self.cost.preview_price(bar.close, side, estimate, bars, index);
                let sized = (cap / executed).floor();
                if sized < 1.0 {
                    return Ok(());
                }
                sized
            }
        };

        let fill = self
            .cost
            .execute(bar.close, side, quantity, FillKind::Entry, bars, index);
        self.record_fill(&fill, bar.close, quantity);
        self.entry_meta = Some(EntryMeta {
            commission: fill.commission,
            diagnostics: TradeDiagnostics {
                market_impact: fill.market_impact,
                effective_slippage: fill.slippage_rate,
                commission_tier: fill.commission_tier,
                time_of_day_factor: fill.time_of_day_factor,
                volatility_factor: fill.volatility_factor,
            },
        });
        self.position = match side {
            Side::Buy => Position::Long {
                entry_price: fill.price,
                entry_time: bar.timestamp,
                quantity,
                stop,
                take_profit,
            },
            Side::Sell => Position::Short {
                entry_price: fill.price,
                entry_time: bar.timestamp,
                quantity,
                stop,
                take_profit,
            },
        };
        Ok(())
    }

    /// Close the open position at `level`, realize P&L into equity and append
    /// the trade. No-op when flat.
    fn close_position(
        &mut self,
        level: f64,
        reason: ExitReason,
        bar: &Bar,
        bars: &[Bar],
        index: usize,
        observer: &mut dyn BacktestObserver,
    ) {
        let (side, entry_price, entry_time, quantity, exit_side) = match self.position {
            Position::Long {
                entry_price,
                entry_time,
                quantity,
                ..
            } => (Side::Buy, entry_price, entry_time, quantity, Side::Sell),
            Position::Short {
                entry_price,
                entry_time,
                quantity,
                ..
            } => (Side::Sell, entry_price, entry_time, quantity, Side::Buy),
            Position::Flat => return,
        };

        let fill = self
            .cost
            .execute(level, exit_side, quantity, FillKind::Exit, bars, index);
        self.record_fill(&fill, level, quantity);
        let meta = self.entry_meta.take().unwrap_or(EntryMeta {
            commission: 0.0,
            diagnostics: TradeDiagnostics::default(),
        });

        let gross = match side {
            Side::Buy => (fill.price - entry_price) * quantity,
            Side::Sell => (entry_price - fill.price) * quantity,
        };
        let fees = meta.commission + fill.commission;
        let pnl = gross - fees;
        let entry_notional = entry_price * quantity;
        let pnl_pct = if entry_notional > 0.0 {
            pnl / entry_notional
        } else {
            0.0
        };

        let trade = Trade {
            id: self.next_trade_id,
            symbol: self.config.symbol.clone(),
            side,
            entry_time,
            exit_time: bar.timestamp,
            entry_price,
            exit_price: fill.price,
            quantity,
            pnl,
            pnl_pct,
            fees,
            exit_reason: reason,
            diagnostics: meta.diagnostics,
        };
        self.next_trade_id += 1;
        self.equity += pnl;
        self.position = Position::Flat;
        observer.on_trade_closed(&trade);
        self.trades.push(trade);
    }

    fn record_fill(&mut self, fill: &Fill, reference: f64, quantity: f64) {
        self.total_commission += fill.commission;
        self.total_slippage_cost += (fill.price - reference).abs() * quantity;
        self.fill_count += 1;
        self.sum_slippage_rate += fill.slippage_rate;
        self.max_slippage_rate = self.max_slippage_rate.max(fill.slippage_rate);
        self.sum_market_impact += fill.market_impact;
        self.sum_time_of_day += fill.time_of_day_factor;
        self.sum_volatility += fill.volatility_factor;
        self.sum_participation += fill.participation;
    }

    fn into_result(self, config: &BacktestConfig, duration_days: f64) -> SimulationResult {
        let metrics = compute_metrics(
            &self.trades,
            &self.equity_curve,
            config.initial_capital,
            duration_days,
        );
        let fills = self.fill_count;
        let avg = |sum: f64| if fills > 0 { sum / fills as f64 } else { 0.0 };
        SimulationResult {
            metrics,
            transaction_costs: TransactionCostSummary {
                total_commission: self.total_commission,
                total_slippage_cost: self.total_slippage_cost,
                fills,
            },
            execution_quality: ExecutionQuality {
                avg_slippage_rate: avg(self.sum_slippage_rate),
                max_slippage_rate: self.max_slippage_rate,
                avg_market_impact: avg(self.sum_market_impact),
                avg_time_of_day_factor: avg(self.sum_time_of_day),
                avg_volatility_factor: avg(self.sum_volatility),
                avg_participation: avg(self.sum_participation),
            },
            initial_capital: config.initial_capital,
            final_equity: self.equity,
            duration_days,
            trades: self.trades,
            equity_curve: self.equity_curve,
        }
    }
}

/// Reject malformed strategy actions before they reach the cost model.
fn validate_action(action: &StrategyAction, index: usize) -> Result<(), BacktestError> {
    let check_levels = |quantity: &Option<f64>,
                        stop: &Option<f64>,
                        take: &Option<f64>|
     -> Result<(), BacktestError> {
        if let Some(q) = quantity {
            if !q.is_finite() || *q <= 0.0 {
                return Err(BacktestError::InvalidStrategyAction {
                    index,
                    reason: format!("non-finite or non-positive quantity {q}"),
                });
            }
        }
        for level in [stop, take].into_iter().flatten() {
            if !level.is_finite() || *level <= 0.0 {
                return Err(BacktestError::InvalidStrategyAction {
                    index,
                    reason: format!("non-finite or negative protective level {level}"),
                });
            }
        }
        Ok(())
    };
    match action {
        StrategyAction::Buy {
            quantity,
            stop_loss,
            take_profit,
        } => check_levels(quantity, stop_loss, take_profit),
        StrategyAction::Sell {
            quantity,
            stop_loss,
            take_profit,
        } => check_levels(quantity, stop_loss, take_profit),
        StrategyAction::Close | StrategyAction::Hold => Ok(()),
    }
}
