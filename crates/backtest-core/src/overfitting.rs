//! In-sample vs. out-of-sample overfitting diagnostics.
//!
//! Indicator thresholds behind the emitted advice (each maps to one message
//! id, never free text):
//!
//! | condition                         | warning                  |
//! |-----------------------------------|--------------------------|
//! | score > 0.7                       | `SevereOverfitting`      |
//! | performance_degradation >= 0.6    | `PerformanceDegradation` |
//! | sharpe_ratio_drop >= 0.6          | `SharpeDrop`             |
//! | parameter_instability >= 0.5      | `ExcessiveParameters`    |
//! | complexity_penalty >= 0.5         | `HighComplexity`         |
//! | walk_forward_consistency < 0.5    | `InconsistentWalkForward`|
//! | combined trades < 30              | `LowSampleSize`          |

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::PerformanceMetrics;
use crate::statistical::sharpe_p_value;
use crate::walk_forward::WalkForwardSlice;

/// A single typed strategy parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Choice(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDescriptor {
    pub name: String,
    pub value: ParamValue,
}

/// The tuned parameters of a strategy, used to penalize heavy search spaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ParameterSet {
    pub params: Vec<ParamDescriptor>,
}

impl ParameterSet {
    pub fn count(&self) -> usize {
        self.params.len()
    }
}

/// Structural complexity of a strategy beyond its parameter count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComplexityDescriptor {
    /// Caller-supplied structural complexity in [0, 1].
    pub complexity_score: f64,
    /// Annualized portfolio turnover.
    pub turnover: f64,
    pub avg_holding_period_bars: f64,
}

/// Per-dimension suspicion levels, each in [0, 1]. `None` = the inputs needed
/// for that indicator were not supplied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverfitIndicators {
    pub performance_degradation: f64,
    pub sharpe_ratio_drop: f64,
    pub parameter_instability: Option<f64>,
    pub complexity_penalty: Option<f64>,
    pub walk_forward_consistency: Option<f64>,
}

/// Enumerated warning ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverfitWarning {
    SevereOverfitting,
    PerformanceDegradation,
    SharpeDrop,
    ExcessiveParameters,
    HighComplexity,
    InconsistentWalkForward,
    LowSampleSize,
}

impl fmt::Display for OverfitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            OverfitWarning::SevereOverfitting => {
                "severe overfitting: in-sample performance is unlikely to generalize"
            }
            OverfitWarning::PerformanceDegradation => {
                "out-of-sample returns degrade sharply from in-sample"
            }
            OverfitWarning::SharpeDrop => "out-of-sample Sharpe ratio drops sharply from in-sample",
            OverfitWarning::ExcessiveParameters => {
                "parameter count is high relative to the evidence"
            }
            OverfitWarning::HighComplexity => "strategy complexity penalty is high",
            OverfitWarning::InconsistentWalkForward => {
                "walk-forward slices disagree on out-of-sample performance"
            }
            OverfitWarning::LowSampleSize => {
                "combined trade count is too small for reliable inference"
            }
        };
        f.write_str(msg)
    }
}

/// Enumerated recommendation ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverfitRecommendation {
    ReduceParameters,
    SimplifyStrategy,
    UseWalkForward,
    CollectMoreData,
}

impl fmt::Display for OverfitRecommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            OverfitRecommendation::ReduceParameters => "reduce number of parameters",
            OverfitRecommendation::SimplifyStrategy => {
                "simplify the strategy logic and remove redundant filters"
            }
            OverfitRecommendation::UseWalkForward => {
                "validate across more walk-forward slices before deployment"
            }
            OverfitRecommendation::CollectMoreData => {
                "extend the sample or trade count before trusting the edge"
            }
        };
        f.write_str(msg)
    }
}

/// Outcome of the overfitting analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverfittingReport {
    pub overfit: bool,
    /// Weighted blend of the indicators present, in [0, 1].
    pub score: f64,
    /// How much evidence backs the verdict, in [0, 1].
    pub confidence: f64,
    pub indicators: OverfitIndicators,
    pub warnings: Vec<OverfitWarning>,
    pub recommendations: Vec<OverfitRecommendation>,
    /// Significance of the in-sample Sharpe over the combined trade count.
    pub in_sample_sharpe_p_value: f64,
}

/// Compare in-sample vs. out-of-sample metrics (optionally enriched with
/// walk-forward slices, the tuned parameter set and a complexity descriptor)
/// and score how much of the in-sample edge looks like curve fitting.
pub fn analyze_overfitting(
    in_sample: &PerformanceMetrics,
    out_of_sample: &PerformanceMetrics,
    walk_forward: Option<&[WalkForwardSlice]>,
    parameters: Option<&ParameterSet>,
    complexity: Option<&ComplexityDescriptor>,
) -> OverfittingReport {
    let degradation = performance_degradation(in_sample.total_return, out_of_sample.total_return);
    let sharpe_drop = sharpe_ratio_drop(in_sample.sharpe_ratio, out_of_sample.sharpe_ratio);

    let instability = parameters.map(|p| {
        parameter_instability(
            p.count(),
            in_sample.total_return,
            out_of_sample.total_return,
        )
    });
    let penalty = if parameters.is_some() || complexity.is_some() {
        Some(complexity_penalty(
            parameters.map(ParameterSet::count),
            complexity,
        ))
    } else {
        None
    };
    let consistency = walk_forward
        .filter(|slices| !slices.is_empty())
        .map(walk_forward_consistency);

    // Weighted mean over the indicators actually provided.
    let mut weighted = 0.0;
    let mut weight_sum = 0.0;
    let mut add = |value: f64, weight: f64| {
        weighted += value * weight;
        weight_sum += weight;
    };
    add(degradation, 0.3);
    add(sharpe_drop, 0.2);
    if let Some(v) = instability {
        add(v, 0.15);
    }
    if let Some(v) = penalty {
        add(v, 0.15);
    }
    if let Some(c) = consistency {
        add(1.0 - c, 0.2);
    }
    let score = if weight_sum > 0.0 {
        (weighted / weight_sum).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let combined_trades = in_sample.total_trades + out_of_sample.total_trades;
    let slice_count = walk_forward.map_or(0, <[WalkForwardSlice]>::len);
    let mut confidence: f64 = 0.3;
    confidence += match slice_count {
        0..=2 => 0.0,
        3..=4 => 0.2,
        _ => 0.4,
    };
    if parameters.is_some() {
        confidence += 0.15;
    }
    if complexity.is_some() {
        confidence += 0.15;
    }
    if combined_trades > 100 {
        confidence += 0.1;
    } else if combined_trades > 50 {
        confidence += 0.05;
    }
    let confidence = confidence.min(1.0);

    let indicators = OverfitIndicators {
        performance_degradation: degradation,
        sharpe_ratio_drop: sharpe_drop,
        parameter_instability: instability,
        complexity_penalty: penalty,
        walk_forward_consistency: consistency,
    };

    let mut warnings = Vec::new();
    let mut recommendations = Vec::new();
    let recommend = |r: OverfitRecommendation, recommendations: &mut Vec<_>| {
        if !recommendations.contains(&r) {
            recommendations.push(r);
        }
    };
    if score > 0.7 {
        warnings.push(OverfitWarning::SevereOverfitting);
    }
    if degradation >= 0.6 {
        warnings.push(OverfitWarning::PerformanceDegradation);
        recommend(OverfitRecommendation::UseWalkForward, &mut recommendations);
    }
    if sharpe_drop >= 0.6 {
        warnings.push(OverfitWarning::SharpeDrop);
    }
    if instability.is_some_and(|v| v >= 0.5) {
        warnings.push(OverfitWarning::ExcessiveParameters);
        recommend(OverfitRecommendation::ReduceParameters, &mut recommendations);
    }
    if penalty.is_some_and(|v| v >= 0.5) {
        warnings.push(OverfitWarning::HighComplexity);
        recommend(OverfitRecommendation::SimplifyStrategy, &mut recommendations);
    }
    if consistency.is_some_and(|v| v < 0.5) {
        warnings.push(OverfitWarning::InconsistentWalkForward);
        recommend(OverfitRecommendation::UseWalkForward, &mut recommendations);
    }
    if combined_trades < 30 {
        warnings.push(OverfitWarning::LowSampleSize);
        recommend(OverfitRecommendation::CollectMoreData, &mut recommendations);
    }

    OverfittingReport {
        overfit: score > 0.5,
        score,
        confidence,
        indicators,
        warnings,
        recommendations,
        in_sample_sharpe_p_value: sharpe_p_value(in_sample.sharpe_ratio, combined_trades),
    }
}

/// How much of the in-sample return vanished out-of-sample.
fn performance_degradation(in_return: f64, out_return: f64) -> f64 {
    if in_return > 0.0 && out_return > 0.0 {
        (((in_return - out_return) / in_return) / 0.3).clamp(0.0, 1.0)
    } else if in_return > 0.0 {
        1.0
    } else if in_return < 0.0 && out_return < 0.0 {
        0.3
    } else {
        0.5
    }
}

fn sharpe_ratio_drop(in_sharpe: f64, out_sharpe: f64) -> f64 {
    if in_sharpe <= 0.0 {
        return 0.0;
    }
    (((in_sharpe - out_sharpe) / in_sharpe) / 0.5).clamp(0.0, 1.0)
}

/// Grows with parameter count; jumps when a heavy parameter set coincides
/// with a collapsed out-of-sample return.
fn parameter_instability(count: usize, in_return: f64, out_return: f64) -> f64 {
    let base = (count as f64 / 20.0).min(1.0);
    if count > 10 && in_return > 0.0 && out_return / in_return < 0.5 {
        base.max(0.8)
    } else {
        base
    }
}

fn complexity_penalty(param_count: Option<usize>, complexity: Option<&ComplexityDescriptor>) -> f64 {
    let mut penalty: f64 = 0.0;
    if param_count.is_some_and(|k| k > 15) {
        penalty += 0.3;
    }
    if let Some(c) = complexity {
        if c.turnover > 5.0 {
            penalty += 0.25;
        }
        if c.avg_holding_period_bars < 2.0 {
            penalty += 0.25;
        }
        if c.complexity_score > 0.7 {
            penalty += 0.3;
        }
    }
    penalty.min(1.0)
}

/// `pass_rate * (1 - min(1, cv))` over the slices' out-of-sample returns.
fn walk_forward_consistency(slices: &[WalkForwardSlice]) -> f64 {
    let scores: Vec<f64> = slices
        .iter()
        .map(|s| s.out_of_sample.total_return)
        .collect();
    let pass_rate = scores.iter().filter(|s| **s > 0.0).count() as f64 / scores.len() as f64;
    let mean = crate::metrics::mean(&scores);
    let cv = if mean.abs() > f64::EPSILON {
        crate::metrics::stddev(&scores, mean) / mean.abs()
    } else {
        1.0
    };
    pass_rate * (1.0 - cv.min(1.0))
}

/// Early-stopping advisor for optimization loops feeding the detector.
///
/// Reports `stop` when 50 iterations pass without improvement, when the
/// recent 10-iteration mean Sharpe falls below half the best seen, or when
/// the best Sharpe exceeds 5 (suspiciously perfect).
#[derive(Debug, Clone)]
pub struct EarlyStopMonitor {
    best_sharpe: f64,
    since_improvement: usize,
    recent: VecDeque<f64>,
}

impl Default for EarlyStopMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl EarlyStopMonitor {
    pub fn new() -> Self {
        Self {
            best_sharpe: f64::NEG_INFINITY,
            since_improvement: 0,
            recent: VecDeque::with_capacity(10),
        }
    }

    pub fn best_sharpe(&self) -> f64 {
        self.best_sharpe
    }

    /// Record one optimization iteration's Sharpe; returns true to stop.
    pub fn observe(&mut self, sharpe: f64) -> bool {
        if sharpe > self.best_sharpe {
            self.best_sharpe = sharpe;
            self.since_improvement = 0;
        } else {
            self.since_improvement += 1;
        }
        if self.recent.len() == 10 {
            self.recent.pop_front();
        }
        self.recent.push_back(sharpe);

        if self.best_sharpe > 5.0 {
            return true;
        }
        if self.since_improvement >= 50 {
            return true;
        }
        if self.recent.len() == 10 && self.best_sharpe > 0.0 {
            let recent_mean = self.recent.iter().sum::<f64>() / 10.0;
            if recent_mean < 0.5 * self.best_sharpe {
                return true;
            }
        }
        false
    }
}
