use crate::models::{Bar, Position, SimulationResult, StrategyAction, Trade};

/// The immutable view a strategy receives each bar. `bars` covers the series
/// up to and including the current bar; strategies must not retain it.
#[derive(Debug, Clone, Copy)]
pub struct StrategyContext<'a> {
    pub bars: &'a [Bar],
    /// Index of the current bar within the full series.
    pub index: usize,
    pub position: &'a Position,
    /// Entry price of the open position, if any.
    pub entry_price: Option<f64>,
    /// Account equity as of the previous close event.
    pub equity: f64,
}

impl<'a> StrategyContext<'a> {
    /// The bar currently being processed.
    pub fn current(&self) -> &Bar {
        &self.bars[self.bars.len() - 1]
    }
}

/// A trading strategy driven once per bar by the simulator.
pub trait Strategy {
    /// Called once before the first bar.
    fn on_init(&mut self) {}

    /// Decide the action for the current bar.
    fn on_bar(&mut self, ctx: &StrategyContext<'_>) -> StrategyAction;

    /// Called once after the run with the completed result.
    fn on_end(&mut self, _result: &SimulationResult) {}
}

/// Typed lifecycle observer for simulator events.
pub trait BacktestObserver {
    fn on_trade_closed(&mut self, _trade: &Trade) {}
    fn on_run_complete(&mut self, _result: &SimulationResult) {}
}

/// No-op observer used by the plain `run` path.
pub(crate) struct NullObserver;

impl BacktestObserver for NullObserver {}
