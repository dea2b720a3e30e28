use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

const EULER_MASCHERONI: f64 = 0.5772156649015329;

/// p-value for the null hypothesis that the true Sharpe ratio is zero.
///
/// The sample Sharpe is asymptotically normal with standard error
/// `sqrt((1 + SR^2/2) / n)` (Lo, 2002); the p-value is the two-sided tail
/// mass of that sampling distribution beyond the observed value.
pub fn sharpe_p_value(sharpe: f64, num_returns: usize) -> f64 {
    if num_returns < 3 || !sharpe.is_finite() {
        return 1.0;
    }
    let n = num_returns as f64;
    let se = ((1.0 + 0.5 * sharpe * sharpe) / n).sqrt();
    let sampling = Normal::new(0.0, se).expect("positive standard error");
    2.0 * (1.0 - sampling.cdf(sharpe.abs()))
}

/// Deflated Sharpe ratio (Bailey and Lopez de Prado, 2014): the probability
/// that an observed Sharpe, picked as the best of `num_trials` candidates,
/// genuinely beats what selection over pure noise would have produced.
///
/// Sharpe values are per observation period (divide an annualized figure by
/// `sqrt(252)` for daily bars); `excess_kurtosis` follows the same convention
/// as [`PerformanceMetrics`](crate::models::PerformanceMetrics).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeflatedSharpe {
    /// Probability in [0, 1] that the edge is real; 0.5 is agnostic.
    pub deflated_probability: f64,
    pub observed_sharpe: f64,
    /// Expected best Sharpe among the trials under the no-skill null.
    pub expected_max_sharpe_null: f64,
}

pub fn deflated_sharpe_ratio(
    observed_sharpe: f64,
    num_trials: usize,
    num_observations: usize,
    skewness: f64,
    excess_kurtosis: f64,
) -> DeflatedSharpe {
    if num_trials < 2 || num_observations < 3 || !observed_sharpe.is_finite() {
        return DeflatedSharpe {
            deflated_probability: 0.5,
            observed_sharpe,
            expected_max_sharpe_null: 0.0,
        };
    }
    let n = num_trials as f64;
    let t = num_observations as f64;

    // Expected maximum of n independent null Sharpes, each dispersed by
    // 1/sqrt(t), via the extreme-value approximation weighted by the
    // Euler-Mascheroni constant.
    let null_std = t.sqrt().recip();
    let expected_max = null_std
        * ((1.0 - EULER_MASCHERONI) * inverse_normal_cdf(1.0 - 1.0 / n)
            + EULER_MASCHERONI * inverse_normal_cdf(1.0 - 1.0 / (n * std::f64::consts::E)));

    // Probabilistic-Sharpe test against that benchmark; the denominator
    // corrects for non-normal returns.
    let sr = observed_sharpe;
    let correction = (1.0 - skewness * sr + (excess_kurtosis + 2.0) / 4.0 * sr * sr).max(1e-12);
    let z = (sr - expected_max) * (t - 1.0).sqrt() / correction.sqrt();

    DeflatedSharpe {
        deflated_probability: normal_cdf(z),
        observed_sharpe,
        expected_max_sharpe_null: expected_max,
    }
}

/// Minimum number of return observations needed to distinguish
/// `expected_sharpe` from zero at the given confidence and power.
pub fn minimum_backtest_length(expected_sharpe: f64, confidence_level: f64, power: f64) -> usize {
    if expected_sharpe.abs() < 0.01 {
        return 10_000;
    }
    let z_alpha = inverse_normal_cdf(1.0 - (1.0 - confidence_level) / 2.0);
    let z_beta = inverse_normal_cdf(power);
    (((z_alpha + z_beta) / expected_sharpe).powi(2)).ceil() as usize
}

fn normal_cdf(x: f64) -> f64 {
    let normal = Normal::new(0.0, 1.0).expect("unit normal is well-formed");
    normal.cdf(x)
}

fn inverse_normal_cdf(p: f64) -> f64 {
    let normal = Normal::new(0.0, 1.0).expect("unit normal is well-formed");
    normal.inverse_cdf(p)
}
