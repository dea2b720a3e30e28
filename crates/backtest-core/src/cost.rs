use chrono::{DateTime, Timelike};

use crate::models::{BacktestConfig, Bar, CostModelConfig, RealisticCostConfig, Side};

/// Reference volatility used to normalize the rolling return stddev.
const REFERENCE_VOLATILITY: f64 = 0.015;

/// Whether a fill opens or closes a position. Cumulative traded notional for
/// tier selection counts each round trip once, at entry, so a trade's exit
/// already sees its own entry notional while the entry itself is still
/// charged at the preceding tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillKind {
    Entry,
    Exit,
}

/// Priced execution before commission: the realized price and the slippage
/// components that produced it.
#[derive(Debug, Clone, Copy)]
struct Quote {
    price: f64,
    slippage_rate: f64,
    market_impact: f64,
    time_of_day_factor: f64,
    volatility_factor: f64,
    participation: f64,
}

/// One executed fill with its cost breakdown. Rates are fractions of price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    /// Realized execution price after slippage.
    pub price: f64,
    pub commission: f64,
    pub commission_rate: f64,
    /// Tier index the fill landed in; None when the base rate applied.
    pub commission_tier: Option<usize>,
    /// Total slippage rate applied to the reference price.
    pub slippage_rate: f64,
    /// Market impact component of the slippage rate.
    pub market_impact: f64,
    pub time_of_day_factor: f64,
    pub volatility_factor: f64,
    /// Order shares / ADV, 0.0 when impact is not modeled.
    pub participation: f64,
}

/// Deterministic execution cost model.
///
/// Slippage is composed additively in rate space (base + impact + half
/// spread), scaled by the session and volatility multipliers, then applied
/// multiplicatively to the reference price: buys fill higher, sells lower.
/// The volatility multiplier is memoized per bar index for the lifetime of
/// one run; the cache is never shared across runs or threads.
pub struct CostModel {
    commission_rate: f64,
    slippage_rate: f64,
    spread: f64,
    realistic: Option<RealisticCostConfig>,
    vol_cache: Vec<Option<f64>>,
    cumulative_notional: f64,
}

impl CostModel {
    pub fn new(config: &BacktestConfig, bar_count: usize) -> Self {
        let realistic = match &config.cost_model {
            CostModelConfig::Simple => None,
            CostModelConfig::Realistic(r) => Some(r.clone()),
        };
        Self {
            commission_rate: config.commission_rate,
            slippage_rate: config.slippage_rate,
            spread: config.spread,
            realistic,
            vol_cache: vec![None; bar_count],
            cumulative_notional: 0.0,
        }
    }

    /// Notional traded through this model so far.
    pub fn cumulative_notional(&self) -> f64 {
        self.cumulative_notional
    }

    /// Price a fill of `quantity` shares without committing any notional.
    ///
    /// The engine sizes orders off this post-slippage price before the real
    /// execution; nothing but the volatility memo is touched.
    pub fn preview_price(
        &mut self,
        reference_price: f64,
        side: Side,
        quantity: f64,
        bars: &[Bar],
        index: usize,
    ) -> f64 {
        self.quote(reference_price, side, quantity, bars, index).price
    }

    /// Execute an intended fill at `reference_price` for `quantity` shares.
    ///
    /// `bars` is the full series and `index` the current bar; both feed the
    /// volatility window. Inputs are pre-validated by the engine; a
    /// non-finite price or negative quantity here is a programming error.
    pub fn execute(
        &mut self,
        reference_price: f64,
        side: Side,
        quantity: f64,
        kind: FillKind,
        bars: &[Bar],
        index: usize,
    ) -> Fill {
        debug_assert!(self.cumulative_notional >= 0.0);

        let quote = self.quote(reference_price, side, quantity, bars, index);
        let notional = quote.price * quantity;
        let (commission_rate, commission_tier) = self.commission_rate_for(self.cumulative_notional);
        // Tier selection happens before the running total moves, so the trade
        // that crosses a threshold is still charged at the preceding rate.
        if kind == FillKind::Entry {
            self.cumulative_notional += notional;
        }

        Fill {
            price: quote.price,
            commission: notional * commission_rate,
            commission_rate,
            commission_tier,
            slippage_rate: quote.slippage_rate,
            market_impact: quote.market_impact,
            time_of_day_factor: quote.time_of_day_factor,
            volatility_factor: quote.volatility_factor,
            participation: quote.participation,
        }
    }

    fn quote(
        &mut self,
        reference_price: f64,
        side: Side,
        quantity: f64,
        bars: &[Bar],
        index: usize,
    ) -> Quote {
        debug_assert!(reference_price.is_finite() && reference_price > 0.0);
        debug_assert!(quantity.is_finite() && quantity >= 0.0);

        let (impact, participation) = self.market_impact(reference_price, quantity);
        let time_of_day_factor = self.time_of_day_factor(&bars[index]);
        let volatility_factor = self.volatility_factor(bars, index);

        let base = self.slippage_rate + impact + self.spread / 2.0;
        let slippage_rate = base * time_of_day_factor * volatility_factor;

        let price = match side {
            Side::Buy => reference_price * (1.0 + slippage_rate),
            Side::Sell => reference_price * (1.0 - slippage_rate),
        };

        Quote {
            price,
            slippage_rate,
            market_impact: impact,
            time_of_day_factor,
            volatility_factor,
            participation,
        }
    }

    /// Square-root market impact: `lambda * sqrt(order_notional / (ADV * price))`,
    /// with the ratio clamped to [0, 1]. Orders below `1/order_book_depth`
    /// participation get linearly scaled-down impact.
    fn market_impact(&self, price: f64, quantity: f64) -> (f64, f64) {
        let Some(realistic) = &self.realistic else {
            return (0.0, 0.0);
        };
        let Some(adv) = realistic.average_daily_volume else {
            return (0.0, 0.0);
        };
        let notional = price * quantity;
        let ratio = (notional / (adv * price)).clamp(0.0, 1.0);
        let participation = quantity / adv;
        let mut impact = realistic.market_impact_coefficient * ratio.sqrt();
        let full_impact_participation = 1.0 / realistic.order_book_depth as f64;
        if participation < full_impact_participation {
            impact *= participation / full_impact_participation;
        }
        (impact, participation)
    }

    /// Session multiplier from the bar's wall-clock time of day. Bars with no
    /// intraday granularity (midnight timestamps) stay at 1.0.
    fn time_of_day_factor(&self, bar: &Bar) -> f64 {
        let Some(realistic) = &self.realistic else {
            return 1.0;
        };
        if !realistic.use_time_of_day {
            return 1.0;
        }
        let Some(utc) = DateTime::from_timestamp_millis(bar.timestamp) else {
            return 1.0;
        };
        let time = utc.time();
        let minute_of_day = time.hour() * 60 + time.minute();
        if minute_of_day == 0 && time.second() == 0 {
            return 1.0;
        }
        let session = &realistic.session;
        if (session.open_start_min..session.open_end_min).contains(&minute_of_day) {
            session.open_mult
        } else if (session.close_start_min..session.close_end_min).contains(&minute_of_day) {
            session.close_mult
        } else if (session.lunch_start_min..session.lunch_end_min).contains(&minute_of_day) {
            session.lunch_mult
        } else {
            1.0
        }
    }

    /// Rolling-volatility multiplier, memoized per bar index.
    fn volatility_factor(&mut self, bars: &[Bar], index: usize) -> f64 {
        let Some(realistic) = &self.realistic else {
            return 1.0;
        };
        if !realistic.use_volatility_slippage {
            return 1.0;
        }
        if let Some(cached) = self.vol_cache.get(index).copied().flatten() {
            return cached;
        }
        let window = realistic.volatility_window;
        if index < window {
            return 1.0;
        }
        let closes = &bars[index - window..index];
        let returns: Vec<f64> = closes
            .windows(2)
            .map(|w| w[1].close / w[0].close - 1.0)
            .collect();
        if returns.len() < 2 {
            return 1.0;
        }
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        let normalized = var.sqrt() / REFERENCE_VOLATILITY;
        let factor =
            (1.0 + (normalized - 1.0) * (realistic.volatility_multiplier - 1.0)).clamp(0.5, 3.0);
        self.vol_cache[index] = Some(factor);
        factor
    }

    /// Commission rate for the given cumulative notional: the tier with the
    /// largest threshold not exceeding it, or the base rate when tiers are
    /// off or none matches.
    fn commission_rate_for(&self, cumulative: f64) -> (f64, Option<usize>) {
        let Some(realistic) = &self.realistic else {
            return (self.commission_rate, None);
        };
        if !realistic.use_tiered_commissions {
            return (self.commission_rate, None);
        }
        realistic
            .commission_tiers
            .iter()
            .enumerate()
            .rev()
            .find(|(_, t)| cumulative >= t.cumulative_volume_threshold)
            .map(|(i, t)| (t.rate, Some(i)))
            .unwrap_or((self.commission_rate, None))
    }
}
