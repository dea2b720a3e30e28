use crate::models::{PerformanceMetrics, Trade};

const TRADING_DAYS: f64 = 252.0;
const RISK_FREE_ANNUAL: f64 = 0.02;

/// Compute the full metric record from a trade log and equity curve.
///
/// Pure: no I/O, no randomness. Degenerate inputs (no trades, a flat or
/// single-point curve) yield zeros for ratio-like fields rather than NaN;
/// `profit_factor` and `omega_ratio` are the documented exceptions and
/// report `+inf` for lossless profitable runs.
pub fn compute_metrics(
    trades: &[Trade],
    equity_curve: &[f64],
    initial_capital: f64,
    duration_days: f64,
) -> PerformanceMetrics {
    let mut m = PerformanceMetrics::default();
    let rf_daily = RISK_FREE_ANNUAL / TRADING_DAYS;

    // --- Equity-curve statistics ---
    if let Some(last) = equity_curve.last() {
        if initial_capital > 0.0 {
            m.total_return = last / initial_capital - 1.0;
        }
    }
    if duration_days > 0.0 {
        let growth = 1.0 + m.total_return;
        m.annualized_return = if growth > 0.0 {
            growth.powf(365.0 / duration_days) - 1.0
        } else {
            -1.0
        };
    }

    let returns = bar_returns(equity_curve);
    if !returns.is_empty() {
        let avg_return = mean(&returns);
        let std = stddev(&returns, avg_return);
        m.volatility = std * TRADING_DAYS.sqrt();
        if std > 0.0 {
            m.sharpe_ratio = (avg_return - rf_daily) / std * TRADING_DAYS.sqrt();
        }

        let negatives: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        if negatives.len() >= 2 {
            let neg_mean = mean(&negatives);
            let downside = stddev(&negatives, neg_mean);
            if downside > 0.0 {
                m.sortino_ratio = (avg_return - rf_daily) / downside * TRADING_DAYS.sqrt();
            }
        }

        let mut sorted = returns.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let p5 = percentile_sorted(&sorted, 5.0);
        m.var_95 = p5.abs();
        m.var_99 = percentile_sorted(&sorted, 1.0).abs();
        let tail: Vec<f64> = sorted.iter().copied().filter(|r| *r <= p5).collect();
        if !tail.is_empty() {
            m.cvar_95 = mean(&tail);
        }

        if std > 0.0 {
            let n = returns.len() as f64;
            let m3 = returns.iter().map(|r| (r - avg_return).powi(3)).sum::<f64>() / n;
            let m4 = returns.iter().map(|r| (r - avg_return).powi(4)).sum::<f64>() / n;
            m.skewness = m3 / std.powi(3);
            m.kurtosis = m4 / std.powi(4) - 3.0;
        }

        let gains: f64 = returns.iter().map(|r| r.max(0.0)).sum();
        let losses: f64 = returns.iter().map(|r| (-r).max(0.0)).sum();
        m.omega_ratio = ratio_or_infinity(gains, losses);
    }

    let (max_dd, dd_duration, avg_dd) = drawdown_stats(equity_curve);
    m.max_drawdown = max_dd;
    m.max_drawdown_duration = dd_duration;
    m.avg_drawdown = avg_dd;
    if max_dd > 0.0 {
        m.calmar_ratio = m.annualized_return / max_dd;
    }

    // --- Trade-distribution statistics ---
    m.total_trades = trades.len();
    m.winning_trades = trades.iter().filter(|t| t.pnl > 0.0).count();
    m.losing_trades = trades.iter().filter(|t| t.pnl < 0.0).count();
    if !trades.is_empty() {
        m.win_rate = m.winning_trades as f64 / trades.len() as f64;
        m.average_trade = trades.iter().map(|t| t.pnl).sum::<f64>() / trades.len() as f64;
    }

    let gross_profit: f64 = trades.iter().filter(|t| t.pnl > 0.0).map(|t| t.pnl).sum();
    let gross_loss: f64 = trades
        .iter()
        .filter(|t| t.pnl < 0.0)
        .map(|t| t.pnl.abs())
        .sum();
    m.profit_factor = ratio_or_infinity(gross_profit, gross_loss);
    if m.winning_trades > 0 {
        m.average_win = gross_profit / m.winning_trades as f64;
        m.largest_win = trades
            .iter()
            .map(|t| t.pnl)
            .fold(f64::NEG_INFINITY, f64::max)
            .max(0.0);
    }
    if m.losing_trades > 0 {
        m.average_loss = gross_loss / m.losing_trades as f64;
        m.largest_loss = trades
            .iter()
            .map(|t| t.pnl)
            .fold(f64::INFINITY, f64::min)
            .min(0.0);
    }

    let (wins, losses) = consecutive_streaks(trades);
    m.max_consecutive_wins = wins;
    m.max_consecutive_losses = losses;

    m
}

/// Per-bar simple returns from an equity curve.
pub fn bar_returns(equity_curve: &[f64]) -> Vec<f64> {
    equity_curve
        .windows(2)
        .map(|w| if w[0] != 0.0 { w[1] / w[0] - 1.0 } else { 0.0 })
        .collect()
}

/// Single-pass drawdown scan: (max drawdown, bars from peak to deepest
/// trough, mean of the non-zero instantaneous drawdowns).
fn drawdown_stats(equity_curve: &[f64]) -> (f64, usize, f64) {
    let mut peak = f64::NEG_INFINITY;
    let mut peak_idx = 0usize;
    let mut max_dd = 0.0f64;
    let mut max_dd_duration = 0usize;
    let mut dd_sum = 0.0f64;
    let mut dd_count = 0usize;

    for (i, &value) in equity_curve.iter().enumerate() {
        if value >= peak {
            peak = value;
            peak_idx = i;
            continue;
        }
        if peak > 0.0 {
            let dd = (peak - value) / peak;
            dd_sum += dd;
            dd_count += 1;
            if dd > max_dd {
                max_dd = dd;
                max_dd_duration = i - peak_idx;
            }
        }
    }
    let avg = if dd_count > 0 {
        dd_sum / dd_count as f64
    } else {
        0.0
    };
    (max_dd, max_dd_duration, avg)
}

fn consecutive_streaks(trades: &[Trade]) -> (u32, u32) {
    let mut max_wins = 0u32;
    let mut max_losses = 0u32;
    let mut wins = 0u32;
    let mut losses = 0u32;
    for trade in trades {
        if trade.pnl > 0.0 {
            wins += 1;
            losses = 0;
            max_wins = max_wins.max(wins);
        } else if trade.pnl < 0.0 {
            losses += 1;
            wins = 0;
            max_losses = max_losses.max(losses);
        } else {
            wins = 0;
            losses = 0;
        }
    }
    (max_wins, max_losses)
}

/// `numerator / denominator`, with the documented degenerate cases:
/// `+inf` when the denominator is zero but the numerator positive, 0 when
/// both are zero.
fn ratio_or_infinity(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else if numerator > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation around a precomputed mean.
pub(crate) fn stddev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Sort-and-index percentile over an ascending slice, `p` in [0, 100].
pub(crate) fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExitReason, Side, TradeDiagnostics};

    fn trade(pnl: f64) -> Trade {
        Trade {
            id: 0,
            symbol: "TEST".to_string(),
            side: Side::Buy,
            entry_time: 0,
            exit_time: 1,
            entry_price: 100.0,
            exit_price: 100.0 + pnl / 10.0,
            quantity: 10.0,
            pnl,
            pnl_pct: pnl / 1000.0,
            fees: 0.0,
            exit_reason: ExitReason::Signal,
            diagnostics: TradeDiagnostics::default(),
        }
    }

    #[test]
    fn empty_inputs_yield_all_zero_metrics() {
        let m = compute_metrics(&[], &[100_000.0], 100_000.0, 0.0);
        assert_eq!(m.total_return, 0.0);
        assert_eq!(m.sharpe_ratio, 0.0);
        assert_eq!(m.max_drawdown, 0.0);
        assert_eq!(m.profit_factor, 0.0);
        assert_eq!(m.total_trades, 0);
        assert!(m.var_95 == 0.0 && m.cvar_95 == 0.0);
    }

    #[test]
    fn flat_curve_has_zero_volatility_and_ratios() {
        let curve = vec![100.0; 50];
        let m = compute_metrics(&[], &curve, 100.0, 49.0);
        assert_eq!(m.volatility, 0.0);
        assert_eq!(m.sharpe_ratio, 0.0);
        assert_eq!(m.sortino_ratio, 0.0);
        assert_eq!(m.omega_ratio, 0.0);
    }

    #[test]
    fn total_and_annualized_return() {
        let curve = vec![100.0, 105.0, 110.0];
        let m = compute_metrics(&[], &curve, 100.0, 365.0);
        assert!((m.total_return - 0.10).abs() < 1e-12);
        assert!((m.annualized_return - 0.10).abs() < 1e-12);
    }

    #[test]
    fn max_drawdown_magnitude_and_duration() {
        // Peak 120 at index 2, trough 90 at index 5: dd = 0.25, duration 3
        let curve = vec![100.0, 110.0, 120.0, 100.0, 95.0, 90.0, 125.0];
        let m = compute_metrics(&[], &curve, 100.0, 6.0);
        assert!((m.max_drawdown - 0.25).abs() < 1e-12);
        assert_eq!(m.max_drawdown_duration, 3);
        assert!(m.avg_drawdown > 0.0 && m.avg_drawdown < 0.25);
    }

    #[test]
    fn profit_factor_handles_lossless_and_empty_logs() {
        let winners = vec![trade(100.0), trade(50.0)];
        let m = compute_metrics(&winners, &[100.0, 101.0], 100.0, 1.0);
        assert!(m.profit_factor.is_infinite());

        let mixed = vec![trade(100.0), trade(-50.0)];
        let m = compute_metrics(&mixed, &[100.0, 101.0], 100.0, 1.0);
        assert!((m.profit_factor - 2.0).abs() < 1e-12);
    }

    #[test]
    fn trade_distribution_fields() {
        let trades = vec![trade(100.0), trade(-40.0), trade(60.0), trade(-20.0), trade(30.0)];
        let m = compute_metrics(&trades, &[100.0, 101.0], 100.0, 1.0);
        assert_eq!(m.total_trades, 5);
        assert_eq!(m.winning_trades, 3);
        assert_eq!(m.losing_trades, 2);
        assert!((m.win_rate - 0.6).abs() < 1e-12);
        assert!((m.average_win - (190.0 / 3.0)).abs() < 1e-9);
        assert!((m.average_loss - 30.0).abs() < 1e-9);
        assert_eq!(m.largest_win, 100.0);
        assert_eq!(m.largest_loss, -40.0);
        assert_eq!(m.max_consecutive_wins, 1);
        assert_eq!(m.max_consecutive_losses, 1);
    }

    #[test]
    fn consecutive_streaks_count_runs() {
        let trades = vec![
            trade(1.0),
            trade(2.0),
            trade(3.0),
            trade(-1.0),
            trade(-1.0),
            trade(4.0),
        ];
        let m = compute_metrics(&trades, &[100.0, 101.0], 100.0, 1.0);
        assert_eq!(m.max_consecutive_wins, 3);
        assert_eq!(m.max_consecutive_losses, 2);
    }

    #[test]
    fn var_and_cvar_capture_the_left_tail() {
        // 9 mild gains and one -10% bar: the 5th percentile lands on the loss
        let mut curve = vec![100.0];
        for i in 0..9 {
            let prev = curve[i];
            curve.push(prev * 1.001);
        }
        let last = *curve.last().unwrap();
        curve.push(last * 0.90);
        let m = compute_metrics(&[], &curve, 100.0, 10.0);
        assert!((m.var_95 - 0.10).abs() < 1e-9);
        assert!((m.cvar_95 + 0.10).abs() < 1e-9);
        assert!(m.skewness < 0.0);
    }

    #[test]
    fn sortino_uses_only_negative_returns() {
        // Alternate +2% / -1%: downside deviation well below full stddev
        let mut curve = vec![100.0];
        for i in 0..40 {
            let prev = *curve.last().unwrap();
            curve.push(prev * if i % 2 == 0 { 1.02 } else { 0.99 });
        }
        let m = compute_metrics(&[], &curve, 100.0, 40.0);
        assert!(m.sharpe_ratio > 0.0);
        assert!(m.sortino_ratio >= 0.0);
    }
}
