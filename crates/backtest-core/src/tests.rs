use std::collections::HashMap;

use crate::engine::{simulate, BacktestEngine};
use crate::error::BacktestError;
use crate::metrics::compute_metrics;
use crate::models::*;
use crate::monte_carlo::{
    run_monte_carlo, run_monte_carlo_bars, CancellationToken, MonteCarloConfig,
};
use crate::resample::{equity_from_trades, parametric_series, ResampleMethod};
use crate::rng::SimRng;
use crate::strategy::{BacktestObserver, Strategy, StrategyContext};

/// Helper: one bar with a flat OHLC at `close`, stamped at `day` days.
fn bar(day: i64, close: f64) -> Bar {
    Bar::new(day * 86_400_000, close, close, close, close, 1_000.0)
}

/// Helper: flat-bodied bars from a close series, one per day.
fn line_bars(closes: &[f64]) -> Vec<Bar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| bar(i as i64, c))
        .collect()
}

/// Helper: frictionless config with no warm-up.
fn zero_cost_config() -> BacktestConfig {
    BacktestConfig {
        symbol: "TEST".to_string(),
        initial_capital: 100_000.0,
        commission_rate: 0.0,
        slippage_rate: 0.0,
        spread: 0.0,
        max_position_size_pct: 0.5,
        warmup_bars: 0,
        ..BacktestConfig::default()
    }
}

/// Strategy stub replaying a fixed action per bar index.
struct Scripted {
    actions: HashMap<usize, StrategyAction>,
}

impl Scripted {
    fn new(actions: impl IntoIterator<Item = (usize, StrategyAction)>) -> Self {
        Self {
            actions: actions.into_iter().collect(),
        }
    }
}

impl Strategy for Scripted {
    fn on_bar(&mut self, ctx: &StrategyContext<'_>) -> StrategyAction {
        self.actions
            .get(&ctx.index)
            .copied()
            .unwrap_or(StrategyAction::Hold)
    }
}

struct HoldStrategy;

impl Strategy for HoldStrategy {
    fn on_bar(&mut self, _ctx: &StrategyContext<'_>) -> StrategyAction {
        StrategyAction::Hold
    }
}

/// Buys one-bar dips, takes profit at +1%. Deterministic and trade-happy on
/// resampled series.
struct DipBuyer;

impl Strategy for DipBuyer {
    fn on_bar(&mut self, ctx: &StrategyContext<'_>) -> StrategyAction {
        let close = ctx.current().close;
        match (ctx.position, ctx.entry_price) {
            (Position::Flat, _) if ctx.index >= 1 => {
                if close < ctx.bars[ctx.index - 1].close {
                    StrategyAction::buy()
                } else {
                    StrategyAction::Hold
                }
            }
            (Position::Long { .. }, Some(entry)) if close > entry * 1.01 => StrategyAction::Close,
            _ => StrategyAction::Hold,
        }
    }
}

// =============================================================================
// S1: buy-and-hold over a linear ramp
// =============================================================================

#[test]
fn s1_buy_and_hold_ramp() {
    let closes: Vec<f64> = (1..=100).map(|i| i as f64).collect();
    let bars = line_bars(&closes);
    let mut strategy = Scripted::new([(
        49,
        StrategyAction::Buy {
            quantity: Some(10.0),
            stop_loss: None,
            take_profit: None,
        },
    )]);

    let result = simulate(&mut strategy, &bars, &zero_cost_config()).unwrap();

    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert_eq!(trade.entry_price, 50.0);
    assert_eq!(trade.exit_price, 100.0);
    assert_eq!(trade.exit_reason, ExitReason::EndOfData);
    assert_eq!(trade.quantity, 10.0);
    assert!((trade.pnl - 500.0).abs() < 1e-9);
    assert!((result.metrics.total_return - 500.0 / 100_000.0).abs() < 1e-12);
    assert_eq!(result.equity_curve.len(), 101);
    assert!((result.final_equity - 100_500.0).abs() < 1e-9);
}

// =============================================================================
// S2: short through the V, closed on signal
// =============================================================================

#[test]
fn s2_short_through_the_v() {
    let closes: Vec<f64> = (0..=100)
        .map(|i| {
            if i <= 50 {
                100.0 - i as f64
            } else {
                50.0 + (i - 50) as f64
            }
        })
        .collect();
    let bars = line_bars(&closes);
    let mut config = zero_cost_config();
    config.allow_short = true;
    let mut strategy = Scripted::new([
        (10, StrategyAction::sell()),
        (60, StrategyAction::Close),
    ]);

    let result = simulate(&mut strategy, &bars, &config).unwrap();

    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert_eq!(trade.side, Side::Sell);
    assert_eq!(trade.entry_price, 90.0);
    assert_eq!(trade.exit_price, 60.0);
    assert_eq!(trade.exit_reason, ExitReason::Signal);
    let expected = (trade.entry_price - trade.exit_price) * trade.quantity;
    assert!((trade.pnl - expected).abs() < 1e-9);
    assert!(trade.pnl > 0.0);
}

// =============================================================================
// S3: stop-loss fires inside the bar at the stop level
// =============================================================================

#[test]
fn s3_stop_loss_fires_at_the_level() {
    let mut bars = line_bars(&[100.0; 10]);
    bars[6] = Bar::new(6 * 86_400_000, 96.0, 96.0, 94.0, 96.0, 1_000.0);
    let mut strategy = Scripted::new([(
        5,
        StrategyAction::Buy {
            quantity: Some(100.0),
            stop_loss: Some(95.0),
            take_profit: None,
        },
    )]);

    let result = simulate(&mut strategy, &bars, &zero_cost_config()).unwrap();

    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert_eq!(trade.exit_reason, ExitReason::Stop);
    assert_eq!(trade.exit_price, 95.0);
    assert!((trade.pnl - (95.0 - 100.0) * 100.0).abs() < 1e-9);
}

// =============================================================================
// S4: tiered commission boundary across two trades
// =============================================================================

#[test]
fn s4_tiered_commission_boundary() {
    let bars = line_bars(&[100.0; 8]);
    let mut config = zero_cost_config();
    config.max_position_size_pct = 1.0;
    config.commission_rate = 0.01;
    config.cost_model = CostModelConfig::Realistic(RealisticCostConfig {
        use_tiered_commissions: true,
        commission_tiers: vec![
            CommissionTier {
                cumulative_volume_threshold: 0.0,
                rate: 0.001,
            },
            CommissionTier {
                cumulative_volume_threshold: 100_000.0,
                rate: 0.0005,
            },
        ],
        ..RealisticCostConfig::default()
    });
    let buy = StrategyAction::Buy {
        quantity: Some(600.0),
        stop_loss: None,
        take_profit: None,
    };
    let mut strategy = Scripted::new([
        (1, buy),
        (2, StrategyAction::Close),
        (3, buy),
        (4, StrategyAction::Close),
    ]);

    let result = simulate(&mut strategy, &bars, &config).unwrap();
    assert_eq!(result.trades.len(), 2);

    // Trade 1: 60k notional per side, both sides in the first tier.
    let first = &result.trades[0];
    assert!((first.fees - (60.0 + 60.0)).abs() < 1e-9);
    assert_eq!(first.diagnostics.commission_tier, Some(0));

    // Trade 2: entry still below the 100k threshold, exit above it.
    let second = &result.trades[1];
    assert!((second.fees - (60.0 + 30.0)).abs() < 1e-9);
    assert_eq!(second.diagnostics.commission_tier, Some(0));

    assert!((result.transaction_costs.total_commission - 210.0).abs() < 1e-9);
}

// =============================================================================
// S5: Monte Carlo reproducibility under a fixed seed
// =============================================================================

fn synthetic_result() -> SimulationResult {
    let trades: Vec<Trade> = (0..25)
        .map(|i| {
            let pnl = ((i * 37) % 17) as f64 * 120.0 - 800.0;
            Trade {
                id: i as u64 + 1,
                symbol: "TEST".to_string(),
                side: Side::Buy,
                entry_time: i as i64 * 86_400_000,
                exit_time: (i as i64 + 1) * 86_400_000,
                entry_price: 100.0,
                exit_price: 100.0 + pnl / 100.0,
                quantity: 100.0,
                pnl,
                pnl_pct: pnl / 10_000.0,
                fees: 0.0,
                exit_reason: ExitReason::Signal,
                diagnostics: TradeDiagnostics::default(),
            }
        })
        .collect();
    let equity_curve = equity_from_trades(&trades, 100_000.0);
    let metrics = compute_metrics(&trades, &equity_curve, 100_000.0, 100.0);
    let final_equity = *equity_curve.last().unwrap();
    SimulationResult {
        trades,
        equity_curve,
        metrics,
        transaction_costs: TransactionCostSummary::default(),
        execution_quality: ExecutionQuality::default(),
        initial_capital: 100_000.0,
        final_equity,
        duration_days: 100.0,
    }
}

#[test]
fn s5_trade_shuffle_is_reproducible() {
    let result = synthetic_result();
    let mc = MonteCarloConfig {
        iterations: 200,
        method: ResampleMethod::TradeShuffle,
        base_seed: 42,
        ..MonteCarloConfig::default()
    };

    let first = run_monte_carlo(&result, &mc, None).unwrap();
    let second = run_monte_carlo(&result, &mc, None).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.iterations, 200);
    assert!(first.total_return.p5 <= first.total_return.p50);
    assert!(first.total_return.p50 <= first.total_return.p95);

    // Shuffling never changes the summed P&L, so every run lands on the same
    // total return.
    assert!(first.total_return.std_dev < 1e-12);
    assert!(
        (first.total_return.mean - result.metrics.total_return).abs() < 1e-9
    );
}

// =============================================================================
// Invariants over the simulator
// =============================================================================

#[test]
fn trade_pairing_and_ordering_through_a_reversal() {
    let closes: Vec<f64> = (0..40).map(|i| 100.0 + (i % 7) as f64).collect();
    let bars = line_bars(&closes);
    let mut config = zero_cost_config();
    config.allow_short = true;
    let mut strategy = Scripted::new([
        (5, StrategyAction::buy()),
        (10, StrategyAction::sell()), // closes the long, reverses short
        (15, StrategyAction::Close),
    ]);

    let result = simulate(&mut strategy, &bars, &config).unwrap();

    assert_eq!(result.trades.len(), 2);
    for trade in &result.trades {
        assert!(trade.exit_time > trade.entry_time);
    }
    assert_eq!(result.trades[0].side, Side::Buy);
    assert_eq!(result.trades[1].side, Side::Sell);
    assert_eq!(result.trades[0].exit_time, result.trades[1].entry_time);
    assert!(result.trades[0].id < result.trades[1].id);
}

#[test]
fn equity_moves_only_on_closes_and_reconciles_with_pnl() {
    let bars = line_bars(&[100.0; 8]);
    let mut config = zero_cost_config();
    config.commission_rate = 0.001;
    config.max_position_size_pct = 1.0;
    let buy = StrategyAction::Buy {
        quantity: Some(100.0),
        stop_loss: None,
        take_profit: None,
    };
    let mut strategy = Scripted::new([(1, buy), (3, StrategyAction::Close)]);

    let result = simulate(&mut strategy, &bars, &config).unwrap();

    let pnl_sum: f64 = result.trades.iter().map(|t| t.pnl).sum();
    assert!((result.final_equity - (100_000.0 + pnl_sum)).abs() < 1e-9);

    // Bars 0-2 carry the untouched initial capital; the close lands on bar 3.
    assert_eq!(result.equity_curve[0], 100_000.0);
    assert_eq!(result.equity_curve[1], 100_000.0);
    assert_eq!(result.equity_curve[3], 100_000.0);
    assert!((result.equity_curve[4] - (100_000.0 + pnl_sum)).abs() < 1e-9);
    assert_eq!(*result.equity_curve.last().unwrap(), result.final_equity);
}

#[test]
fn simulate_is_deterministic_across_invocations() {
    let closes: Vec<f64> = (0..120)
        .map(|i| 100.0 * (1.0 + 0.002 * ((i % 11) as f64 - 5.0)))
        .collect();
    let bars = line_bars(&closes);
    let mut config = zero_cost_config();
    config.commission_rate = 0.001;
    config.slippage_rate = 0.0005;

    let first = simulate(&mut DipBuyer, &bars, &config).unwrap();
    let second = simulate(&mut DipBuyer, &bars, &config).unwrap();
    assert_eq!(first, second);
    assert!(first.trades.len() > 1);
}

#[test]
fn disjoint_series_compose_when_flat_at_the_boundary() {
    let closes: Vec<f64> = (1..=80).map(|i| i as f64).collect();
    let bars = line_bars(&closes);
    let qty = |q: f64| StrategyAction::Buy {
        quantity: Some(q),
        stop_loss: None,
        take_profit: None,
    };

    // Trades keyed to absolute bar closes so the script survives re-slicing.
    let full = Scripted::new([
        (9, qty(10.0)),
        (19, StrategyAction::Close),
        (49, qty(10.0)),
        (59, StrategyAction::Close),
    ]);
    let first_half = Scripted::new([(9, qty(10.0)), (19, StrategyAction::Close)]);
    let second_half = Scripted::new([(9, qty(10.0)), (19, StrategyAction::Close)]);

    let config = zero_cost_config();
    let mut full = full;
    let whole = simulate(&mut full, &bars, &config).unwrap();
    let mut a = first_half;
    let left = simulate(&mut a, &bars[..40], &config).unwrap();
    let mut b = second_half;
    let right = simulate(&mut b, &bars[40..], &config).unwrap();

    let whole_pnl: f64 = whole.trades.iter().map(|t| t.pnl).sum();
    let split_pnl: f64 = left
        .trades
        .iter()
        .chain(right.trades.iter())
        .map(|t| t.pnl)
        .sum();
    assert!((whole_pnl - split_pnl).abs() < 1e-9);
}

// =============================================================================
// Boundary behaviors
// =============================================================================

#[test]
fn series_shorter_than_warmup_is_a_clean_no_trade_run() {
    let bars = line_bars(&[100.0; 10]);
    let mut config = zero_cost_config();
    config.warmup_bars = 50;

    let result = simulate(&mut HoldStrategy, &bars, &config).unwrap();

    assert!(result.trades.is_empty());
    assert_eq!(result.equity_curve, vec![100_000.0]);
    assert_eq!(result.metrics.total_return, 0.0);
    assert_eq!(result.metrics.sharpe_ratio, 0.0);
    assert_eq!(result.metrics.max_drawdown, 0.0);
}

#[test]
fn hold_strategy_produces_a_flat_curve() {
    let bars = line_bars(&[100.0; 50]);
    let result = simulate(&mut HoldStrategy, &bars, &zero_cost_config()).unwrap();

    assert!(result.trades.is_empty());
    assert_eq!(result.equity_curve.len(), 51);
    assert!(result.equity_curve.iter().all(|&e| e == 100_000.0));
}

#[test]
fn kill_switch_halts_the_run_and_liquidates() {
    let bars = line_bars(&[100.0, 100.0, 80.0, 80.0, 60.0, 60.0, 60.0, 60.0]);
    let mut config = zero_cost_config();
    config.max_drawdown_pct = Some(0.15);
    let mut strategy = Scripted::new([
        (1, StrategyAction::buy()),
        (2, StrategyAction::Close),
        (3, StrategyAction::buy()),
        (4, StrategyAction::Close),
        (5, StrategyAction::buy()), // never reached: the run halts on bar 4
    ]);

    let result = simulate(&mut strategy, &bars, &config).unwrap();

    assert_eq!(result.trades.len(), 2);
    // Curve: initial + bars 0..=4, nothing afterwards.
    assert_eq!(result.equity_curve.len(), 6);
    let drawdown = 1.0 - result.final_equity / 100_000.0;
    assert!(drawdown > 0.15);
    assert_eq!(*result.equity_curve.last().unwrap(), result.final_equity);
}

#[test]
fn default_sizing_respects_the_cap_at_the_executed_price() {
    let bars = line_bars(&[100.0; 10]);
    let mut config = zero_cost_config();
    config.slippage_rate = 0.01;
    let mut strategy = Scripted::new([(1, StrategyAction::buy())]);

    let result = simulate(&mut strategy, &bars, &config).unwrap();

    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    // Buys fill at 101 after 1% slippage; the sized notional at that fill
    // price stays under half the equity.
    assert!((trade.entry_price - 101.0).abs() < 1e-9);
    assert!(trade.entry_price * trade.quantity <= 50_000.0 + 1e-9);
    assert_eq!(trade.quantity, (50_000.0_f64 / 101.0).floor());
}

#[test]
fn explicit_fractional_quantities_are_honored_verbatim() {
    let closes: Vec<f64> = (0..10).map(|i| 100.0 + 2.0 * i as f64).collect();
    let bars = line_bars(&closes);
    let mut strategy = Scripted::new([
        (
            1,
            StrategyAction::Buy {
                quantity: Some(0.5),
                stop_loss: None,
                take_profit: None,
            },
        ),
        (3, StrategyAction::Close),
    ]);

    let result = simulate(&mut strategy, &bars, &zero_cost_config()).unwrap();

    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert_eq!(trade.quantity, 0.5);
    // Entry at 102, exit at 106, half a share
    assert!((trade.pnl - 2.0).abs() < 1e-9);
}

#[test]
fn take_profit_fires_at_the_target_level() {
    let mut bars = line_bars(&[100.0; 10]);
    bars[7] = Bar::new(7 * 86_400_000, 104.0, 111.0, 104.0, 108.0, 1_000.0);
    let mut strategy = Scripted::new([(
        4,
        StrategyAction::Buy {
            quantity: Some(50.0),
            stop_loss: Some(90.0),
            take_profit: Some(110.0),
        },
    )]);

    let result = simulate(&mut strategy, &bars, &zero_cost_config()).unwrap();
    assert_eq!(result.trades.len(), 1);
    assert_eq!(result.trades[0].exit_reason, ExitReason::Target);
    assert_eq!(result.trades[0].exit_price, 110.0);
}

// =============================================================================
// Error surfaces
// =============================================================================

#[test]
fn malformed_bars_are_rejected_before_the_run() {
    let mut broken = line_bars(&[100.0; 5]);
    broken[2].high = 90.0; // high below the body
    let err = simulate(&mut HoldStrategy, &broken, &zero_cost_config()).unwrap_err();
    assert!(matches!(err, BacktestError::InvalidBarSeries(_)));

    let mut unordered = line_bars(&[100.0; 5]);
    unordered[3].timestamp = unordered[1].timestamp;
    let err = simulate(&mut HoldStrategy, &unordered, &zero_cost_config()).unwrap_err();
    assert!(matches!(err, BacktestError::InvalidBarSeries(_)));

    let err = simulate(&mut HoldStrategy, &[], &zero_cost_config()).unwrap_err();
    assert!(matches!(err, BacktestError::InvalidBarSeries(_)));
}

#[test]
fn invalid_configs_never_start_a_run() {
    let mut negative_rate = zero_cost_config();
    negative_rate.commission_rate = -0.001;
    assert!(matches!(
        BacktestEngine::new(negative_rate),
        Err(BacktestError::InvalidConfig(_))
    ));

    let mut unsorted_tiers = zero_cost_config();
    unsorted_tiers.cost_model = CostModelConfig::Realistic(RealisticCostConfig {
        use_tiered_commissions: true,
        commission_tiers: vec![
            CommissionTier {
                cumulative_volume_threshold: 100_000.0,
                rate: 0.0005,
            },
            CommissionTier {
                cumulative_volume_threshold: 0.0,
                rate: 0.001,
            },
        ],
        ..RealisticCostConfig::default()
    });
    assert!(matches!(
        BacktestEngine::new(unsorted_tiers),
        Err(BacktestError::InvalidConfig(_))
    ));
}

#[test]
fn shorting_without_permission_aborts_the_run() {
    let bars = line_bars(&[100.0; 10]);
    let mut strategy = Scripted::new([(2, StrategyAction::sell())]);
    let err = simulate(&mut strategy, &bars, &zero_cost_config()).unwrap_err();
    assert!(matches!(
        err,
        BacktestError::InvalidStrategyAction { index: 2, .. }
    ));
}

#[test]
fn oversized_orders_abort_the_run() {
    let bars = line_bars(&[100.0; 10]);
    let mut strategy = Scripted::new([(
        2,
        StrategyAction::Buy {
            quantity: Some(10_000.0),
            stop_loss: None,
            take_profit: None,
        },
    )]);
    let err = simulate(&mut strategy, &bars, &zero_cost_config()).unwrap_err();
    assert!(matches!(err, BacktestError::InvalidStrategyAction { .. }));
}

#[test]
fn non_finite_action_fields_abort_the_run() {
    let bars = line_bars(&[100.0; 10]);
    let mut strategy = Scripted::new([(
        2,
        StrategyAction::Buy {
            quantity: Some(f64::NAN),
            stop_loss: None,
            take_profit: None,
        },
    )]);
    let err = simulate(&mut strategy, &bars, &zero_cost_config()).unwrap_err();
    assert!(matches!(err, BacktestError::InvalidStrategyAction { .. }));
}

// =============================================================================
// Monte Carlo end-to-end
// =============================================================================

fn wiggle_bars(n: usize) -> Vec<Bar> {
    let closes: Vec<f64> = (0..n)
        .map(|i| 100.0 * (1.0 + 0.01 * ((i % 9) as f64 - 4.0) / 4.0))
        .collect();
    line_bars(&closes)
}

#[test]
fn bootstrap_monte_carlo_is_seed_deterministic() {
    let bars = wiggle_bars(80);
    let config = zero_cost_config();
    let mc = MonteCarloConfig {
        iterations: 20,
        method: ResampleMethod::Bootstrap,
        base_seed: 7,
        goal_thresholds: vec![0.0, 0.05],
        ..MonteCarloConfig::default()
    };

    let first = run_monte_carlo_bars(&bars, || DipBuyer, &config, &mc, None).unwrap();
    let second = run_monte_carlo_bars(&bars, || DipBuyer, &config, &mc, None).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.iterations, 20);
    assert_eq!(first.risk.goal_probabilities.len(), 2);
    assert!(first.robustness_score >= 0.0 && first.robustness_score <= 1.0);
    assert!(first.probability_of_profit >= 0.0 && first.probability_of_profit <= 1.0);
}

#[test]
fn single_parametric_run_matches_direct_resimulation() {
    let bars = wiggle_bars(120);
    let config = zero_cost_config();
    let mc = MonteCarloConfig {
        iterations: 1,
        method: ResampleMethod::Parametric,
        base_seed: 11,
        ..MonteCarloConfig::default()
    };

    let summary = run_monte_carlo_bars(&bars, || DipBuyer, &config, &mc, None).unwrap();

    let mut rng = SimRng::for_iteration(11, 0);
    let synthetic = parametric_series(&bars, &mut rng).unwrap();
    let direct = simulate(&mut DipBuyer, &synthetic, &config).unwrap();

    assert!((summary.total_return.mean - direct.metrics.total_return).abs() < 1e-12);
    assert_eq!(summary.best_case.total_return, direct.metrics.total_return);
    assert_eq!(summary.worst_case.total_return, direct.metrics.total_return);
}

#[test]
fn parametric_mode_requires_enough_bars() {
    let bars = wiggle_bars(5);
    let config = zero_cost_config();
    let mc = MonteCarloConfig {
        iterations: 10,
        method: ResampleMethod::Parametric,
        ..MonteCarloConfig::default()
    };
    let err = run_monte_carlo_bars(&bars, || DipBuyer, &config, &mc, None).unwrap_err();
    assert!(matches!(err, BacktestError::InsufficientData(_)));
}

#[test]
fn cancellation_discards_partial_aggregation() {
    let token = CancellationToken::new();
    token.cancel();
    let result = synthetic_result();
    let mc = MonteCarloConfig {
        iterations: 50,
        method: ResampleMethod::TradeShuffle,
        ..MonteCarloConfig::default()
    };
    let err = run_monte_carlo(&result, &mc, Some(&token)).unwrap_err();
    assert_eq!(err, BacktestError::Cancelled);
}

#[test]
fn method_and_input_mismatches_are_config_errors() {
    let result = synthetic_result();
    let mc = MonteCarloConfig {
        iterations: 10,
        method: ResampleMethod::Bootstrap,
        ..MonteCarloConfig::default()
    };
    assert!(matches!(
        run_monte_carlo(&result, &mc, None),
        Err(BacktestError::InvalidConfig(_))
    ));

    let bars = wiggle_bars(60);
    let mc = MonteCarloConfig {
        iterations: 10,
        method: ResampleMethod::TradeShuffle,
        ..MonteCarloConfig::default()
    };
    assert!(matches!(
        run_monte_carlo_bars(&bars, || DipBuyer, &zero_cost_config(), &mc, None),
        Err(BacktestError::InvalidConfig(_))
    ));
}

// =============================================================================
// Walk-forward end-to-end
// =============================================================================

#[test]
fn walk_forward_produces_one_slice_per_window() {
    let bars = wiggle_bars(200);
    let config = zero_cost_config();
    let wf = crate::walk_forward::WalkForwardConfig {
        num_slices: 4,
        train_fraction: 0.6,
    };
    let slices = crate::walk_forward::run_walk_forward(&bars, || DipBuyer, &config, &wf).unwrap();
    assert_eq!(slices.len(), 4);
    for slice in &slices {
        assert!(slice.in_sample.total_return.is_finite());
        assert!(slice.out_of_sample.total_return.is_finite());
    }
}

// =============================================================================
// Lifecycle observer
// =============================================================================

#[derive(Default)]
struct CountingObserver {
    closed: usize,
    completed: bool,
}

impl BacktestObserver for CountingObserver {
    fn on_trade_closed(&mut self, _trade: &Trade) {
        self.closed += 1;
    }

    fn on_run_complete(&mut self, _result: &SimulationResult) {
        self.completed = true;
    }
}

#[test]
fn observer_sees_every_close_and_the_completion() {
    let closes: Vec<f64> = (1..=30).map(|i| 100.0 + i as f64).collect();
    let bars = line_bars(&closes);
    let mut strategy = Scripted::new([
        (2, StrategyAction::buy()),
        (5, StrategyAction::Close),
        (10, StrategyAction::buy()),
    ]);
    let engine = BacktestEngine::new(zero_cost_config()).unwrap();
    let mut observer = CountingObserver::default();
    let result = engine
        .run_with_observer(&mut strategy, &bars, &mut observer)
        .unwrap();

    assert_eq!(result.trades.len(), 2); // second position closed at end of data
    assert_eq!(observer.closed, 2);
    assert!(observer.completed);
}

// =============================================================================
// Config serialization round-trip
// =============================================================================

#[test]
fn config_survives_a_serde_round_trip() {
    let config = BacktestConfig {
        symbol: "AAPL".to_string(),
        allow_short: true,
        max_drawdown_pct: Some(0.2),
        cost_model: CostModelConfig::Realistic(RealisticCostConfig {
            average_daily_volume: Some(2_000_000.0),
            use_time_of_day: true,
            use_volatility_slippage: true,
            use_tiered_commissions: true,
            commission_tiers: vec![
                CommissionTier {
                    cumulative_volume_threshold: 0.0,
                    rate: 0.001,
                },
                CommissionTier {
                    cumulative_volume_threshold: 500_000.0,
                    rate: 0.0004,
                },
            ],
            ..RealisticCostConfig::default()
        }),
        ..BacktestConfig::default()
    };

    let json = serde_json::to_string(&config).unwrap();
    let back: BacktestConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(config, back);
    back.validate().unwrap();
}
