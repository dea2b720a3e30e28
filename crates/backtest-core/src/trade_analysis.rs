use serde::{Deserialize, Serialize};

use crate::metrics::{mean, stddev};
use crate::models::Trade;

/// Expected value per trade and the sizing numbers derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpectancyAnalysis {
    /// `win_rate * avg_win - loss_rate * avg_loss`, in account currency.
    pub expectancy: f64,
    /// Expectancy as a fraction of the average entry notional.
    pub expectancy_pct: f64,
    /// Kelly criterion optimal bet fraction; negative means no edge.
    pub kelly_fraction: f64,
    /// `avg_win / avg_loss`.
    pub payoff_ratio: f64,
    /// System quality number: `sqrt(n) * mean(pnl) / stddev(pnl)`.
    pub sqn: f64,
}

/// Distribution of win/loss streaks and the first-order win persistence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreakDistribution {
    pub max_win_streak: u32,
    pub max_loss_streak: u32,
    pub avg_win_streak: f64,
    pub avg_loss_streak: f64,
    pub prob_win_after_win: f64,
    pub prob_win_after_loss: f64,
}

/// Compute expectancy statistics. Needs at least 5 trades to say anything.
pub fn compute_expectancy(trades: &[Trade]) -> Option<ExpectancyAnalysis> {
    if trades.len() < 5 {
        return None;
    }
    let n = trades.len() as f64;
    let wins: Vec<f64> = trades.iter().filter(|t| t.pnl > 0.0).map(|t| t.pnl).collect();
    let losses: Vec<f64> = trades
        .iter()
        .filter(|t| t.pnl < 0.0)
        .map(|t| t.pnl.abs())
        .collect();
    if wins.is_empty() && losses.is_empty() {
        return None;
    }

    let win_rate = wins.len() as f64 / n;
    let loss_rate = losses.len() as f64 / n;
    let avg_win = mean(&wins);
    let avg_loss = mean(&losses);
    let expectancy = win_rate * avg_win - loss_rate * avg_loss;

    let avg_notional = trades
        .iter()
        .map(|t| t.entry_price * t.quantity)
        .sum::<f64>()
        / n;
    let expectancy_pct = if avg_notional > 0.0 {
        expectancy / avg_notional
    } else {
        0.0
    };

    let payoff_ratio = if avg_loss > 0.0 { avg_win / avg_loss } else { 0.0 };
    let kelly_fraction = if payoff_ratio > 0.0 {
        win_rate - loss_rate / payoff_ratio
    } else {
        0.0
    };

    let pnls: Vec<f64> = trades.iter().map(|t| t.pnl).collect();
    let pnl_mean = mean(&pnls);
    let pnl_std = stddev(&pnls, pnl_mean);
    let sqn = if pnl_std > 0.0 {
        n.sqrt() * pnl_mean / pnl_std
    } else {
        0.0
    };

    Some(ExpectancyAnalysis {
        expectancy,
        expectancy_pct,
        kelly_fraction,
        payoff_ratio,
        sqn,
    })
}

/// Compute the streak distribution. Break-even trades end both streaks.
pub fn compute_streaks(trades: &[Trade]) -> Option<StreakDistribution> {
    if trades.len() < 2 {
        return None;
    }

    let mut win_streaks: Vec<u32> = Vec::new();
    let mut loss_streaks: Vec<u32> = Vec::new();
    let mut current_wins = 0u32;
    let mut current_losses = 0u32;
    let mut wins_after_win = 0usize;
    let mut after_win = 0usize;
    let mut wins_after_loss = 0usize;
    let mut after_loss = 0usize;

    for pair in trades.windows(2) {
        if pair[0].pnl > 0.0 {
            after_win += 1;
            if pair[1].pnl > 0.0 {
                wins_after_win += 1;
            }
        } else if pair[0].pnl < 0.0 {
            after_loss += 1;
            if pair[1].pnl > 0.0 {
                wins_after_loss += 1;
            }
        }
    }

    for trade in trades {
        if trade.pnl > 0.0 {
            if current_losses > 0 {
                loss_streaks.push(current_losses);
                current_losses = 0;
            }
            current_wins += 1;
        } else if trade.pnl < 0.0 {
            if current_wins > 0 {
                win_streaks.push(current_wins);
                current_wins = 0;
            }
            current_losses += 1;
        } else {
            if current_wins > 0 {
                win_streaks.push(current_wins);
                current_wins = 0;
            }
            if current_losses > 0 {
                loss_streaks.push(current_losses);
                current_losses = 0;
            }
        }
    }
    if current_wins > 0 {
        win_streaks.push(current_wins);
    }
    if current_losses > 0 {
        loss_streaks.push(current_losses);
    }

    let avg = |streaks: &[u32]| {
        if streaks.is_empty() {
            0.0
        } else {
            streaks.iter().map(|&s| s as f64).sum::<f64>() / streaks.len() as f64
        }
    };
    let rate = |hits: usize, total: usize| {
        if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        }
    };

    Some(StreakDistribution {
        max_win_streak: win_streaks.iter().copied().max().unwrap_or(0),
        max_loss_streak: loss_streaks.iter().copied().max().unwrap_or(0),
        avg_win_streak: avg(&win_streaks),
        avg_loss_streak: avg(&loss_streaks),
        prob_win_after_win: rate(wins_after_win, after_win),
        prob_win_after_loss: rate(wins_after_loss, after_loss),
    })
}
