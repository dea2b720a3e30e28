use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::BacktestError;
use crate::models::{Bar, Trade};
use crate::rng::SimRng;

/// Minimum bars required to estimate the parametric return distribution.
pub const MIN_PARAMETRIC_BARS: usize = 8;

/// How one synthetic Monte Carlo outcome is generated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResampleMethod {
    /// Permute the trade log; keeps the outcome set, destroys ordering.
    TradeShuffle,
    /// Draw bars uniformly with replacement from the original series.
    Bootstrap,
    /// Concatenate contiguous blocks drawn with replacement; preserves
    /// short-range autocorrelation.
    BlockBootstrap { block_size: usize },
    /// Geometric path with Gaussian innovations fitted to the original
    /// log-returns.
    Parametric,
}

/// Uniform Fisher-Yates permutation of the trade log.
pub fn shuffle_trades(trades: &[Trade], rng: &mut SimRng) -> Vec<Trade> {
    let mut shuffled = trades.to_vec();
    shuffled.shuffle(rng);
    shuffled
}

/// Rebuild an equity curve by accumulating trade P&Ls in order, starting from
/// the initial capital.
pub fn equity_from_trades(trades: &[Trade], initial_capital: f64) -> Vec<f64> {
    let mut curve = Vec::with_capacity(trades.len() + 1);
    let mut equity = initial_capital;
    curve.push(equity);
    for trade in trades {
        equity += trade.pnl;
        curve.push(equity);
    }
    curve
}

/// Draw `len(bars)` bars uniformly with replacement, then stamp them with
/// sequential timestamps starting at the original first bar.
pub fn bootstrap_series(bars: &[Bar], rng: &mut SimRng) -> Vec<Bar> {
    let mut synthetic: Vec<Bar> = (0..bars.len())
        .map(|_| bars[rng.gen_range(0..bars.len())])
        .collect();
    reassign_timestamps(&mut synthetic, bars[0].timestamp, timestamp_step(bars));
    synthetic
}

/// Concatenate contiguous blocks of `block_size` bars drawn with replacement
/// until the original length is reached, then truncate and re-stamp.
pub fn block_bootstrap_series(bars: &[Bar], block_size: usize, rng: &mut SimRng) -> Vec<Bar> {
    let n = bars.len();
    let block = block_size.clamp(1, n);
    let mut synthetic: Vec<Bar> = Vec::with_capacity(n + block);
    while synthetic.len() < n {
        let start = rng.gen_range(0..=n - block);
        synthetic.extend_from_slice(&bars[start..start + block]);
    }
    synthetic.truncate(n);
    reassign_timestamps(&mut synthetic, bars[0].timestamp, timestamp_step(bars));
    synthetic
}

/// Simulate a geometric price path with Box-Muller innovations matched to the
/// mean and stddev of the original one-bar log-returns. OHLC is fabricated
/// around each close by stretching with the innovation magnitude; volume is
/// jittered within +/-20% of the original mean.
pub fn parametric_series(bars: &[Bar], rng: &mut SimRng) -> Result<Vec<Bar>, BacktestError> {
    if bars.len() < MIN_PARAMETRIC_BARS {
        return Err(BacktestError::InsufficientData(format!(
            "parametric resampling needs at least {MIN_PARAMETRIC_BARS} bars, got {}",
            bars.len()
        )));
    }
    let log_returns: Vec<f64> = bars
        .windows(2)
        .map(|w| (w[1].close / w[0].close).ln())
        .collect();
    let mean = crate::metrics::mean(&log_returns);
    let std = crate::metrics::stddev(&log_returns, mean);

    let step = timestamp_step(bars);
    let mean_volume = bars.iter().map(|b| b.volume).sum::<f64>() / bars.len() as f64;

    let mut synthetic = Vec::with_capacity(bars.len());
    synthetic.push(bars[0]);
    let mut prev_close = bars[0].close;
    for _ in 1..bars.len() {
        let shock = std * rng.next_gaussian();
        let close = prev_close * (mean + shock).exp();
        let innovation = shock.abs().min(0.99);
        let open = prev_close;
        let high = open.max(close) * (1.0 + innovation);
        let low = open.min(close) * (1.0 - innovation);
        let volume = mean_volume * (0.8 + 0.4 * rng.next_f64());
        synthetic.push(Bar::new(0, open, high, low, close, volume));
        prev_close = close;
    }
    reassign_timestamps(&mut synthetic, bars[0].timestamp, step);
    Ok(synthetic)
}

/// Inter-bar spacing of the original series; one day for single-bar series.
fn timestamp_step(bars: &[Bar]) -> i64 {
    if bars.len() >= 2 {
        (bars[1].timestamp - bars[0].timestamp).max(1)
    } else {
        86_400_000
    }
}

fn reassign_timestamps(bars: &mut [Bar], start: i64, step: i64) {
    for (i, bar) in bars.iter_mut().enumerate() {
        bar.timestamp = start + i as i64 * step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{validate_bar_series, ExitReason, Side, TradeDiagnostics};

    fn trade(id: u64, pnl: f64) -> Trade {
        Trade {
            id,
            symbol: "TEST".to_string(),
            side: Side::Buy,
            entry_time: id as i64,
            exit_time: id as i64 + 1,
            entry_price: 100.0,
            exit_price: 101.0,
            quantity: 1.0,
            pnl,
            pnl_pct: pnl / 100.0,
            fees: 0.0,
            exit_reason: ExitReason::Signal,
            diagnostics: TradeDiagnostics::default(),
        }
    }

    fn ramp_bars(n: usize) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                let c = 100.0 + i as f64;
                Bar::new(i as i64 * 86_400_000, c, c + 1.0, c - 1.0, c, 1_000.0)
            })
            .collect()
    }

    #[test]
    fn shuffling_preserves_the_outcome_set_and_total_pnl() {
        let trades: Vec<Trade> = (0..20).map(|i| trade(i, i as f64 - 10.0)).collect();
        let mut rng = SimRng::new(42);
        let shuffled = shuffle_trades(&trades, &mut rng);

        assert_eq!(shuffled.len(), trades.len());
        let total: f64 = trades.iter().map(|t| t.pnl).sum();
        let shuffled_total: f64 = shuffled.iter().map(|t| t.pnl).sum();
        assert!((total - shuffled_total).abs() < 1e-9);

        let mut ids: Vec<u64> = shuffled.iter().map(|t| t.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..20).collect::<Vec<u64>>());
        // With 20 elements an identity permutation is effectively impossible
        assert!(shuffled.iter().zip(&trades).any(|(a, b)| a.id != b.id));
    }

    #[test]
    fn equity_replay_accumulates_pnl() {
        let trades = vec![trade(1, 50.0), trade(2, -20.0), trade(3, 10.0)];
        let curve = equity_from_trades(&trades, 1_000.0);
        assert_eq!(curve, vec![1_000.0, 1_050.0, 1_030.0, 1_040.0]);
    }

    #[test]
    fn bootstrap_keeps_length_and_sequential_timestamps() {
        let bars = ramp_bars(50);
        let mut rng = SimRng::new(7);
        let synthetic = bootstrap_series(&bars, &mut rng);
        assert_eq!(synthetic.len(), bars.len());
        validate_bar_series(&synthetic).unwrap();
        assert_eq!(synthetic[0].timestamp, bars[0].timestamp);
        assert_eq!(
            synthetic[1].timestamp - synthetic[0].timestamp,
            bars[1].timestamp - bars[0].timestamp
        );
        // Every drawn close exists in the original series
        for bar in &synthetic {
            assert!(bars.iter().any(|b| b.close == bar.close));
        }
    }

    #[test]
    fn block_bootstrap_preserves_contiguous_runs() {
        let bars = ramp_bars(60);
        let mut rng = SimRng::new(9);
        let synthetic = block_bootstrap_series(&bars, 10, &mut rng);
        assert_eq!(synthetic.len(), bars.len());
        validate_bar_series(&synthetic).unwrap();

        // Inside a block, consecutive closes keep the original +1 ramp; block
        // joints land every 10 bars at most
        let contiguous = synthetic
            .windows(2)
            .filter(|w| (w[1].close - w[0].close - 1.0).abs() < 1e-9)
            .count();
        assert!(contiguous >= synthetic.len() - 1 - synthetic.len() / 10);
    }

    #[test]
    fn parametric_needs_enough_history() {
        let bars = ramp_bars(4);
        let mut rng = SimRng::new(1);
        let err = parametric_series(&bars, &mut rng).unwrap_err();
        assert!(matches!(err, BacktestError::InsufficientData(_)));
    }

    #[test]
    fn parametric_series_is_well_formed_and_deterministic() {
        let bars = ramp_bars(100);
        let first = parametric_series(&bars, &mut SimRng::new(42)).unwrap();
        let second = parametric_series(&bars, &mut SimRng::new(42)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), bars.len());
        validate_bar_series(&first).unwrap();
        // Volume jitter stays inside +/-20% of the original mean
        let mean_volume = 1_000.0;
        for bar in &first[1..] {
            assert!(bar.volume >= mean_volume * 0.8 && bar.volume <= mean_volume * 1.2);
        }
    }
}
