// =============================================================================
// Label generation -- forward-looking trade outcomes per horizon
// =============================================================================
//
// For each fill the generator looks up the bars closest to entry time t and
// t + h for every horizon h, computes the signed forward return for the
// trade side, classifies the direction against a symmetric threshold, and
// tracks the maximum favorable / adverse excursion over the holding window.
// A horizon with no future bar yields an absent label, not zero.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::market_data::PriceBar;
use crate::types::Side;

/// Direction class for a forward return against the symmetric threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Flat,
}

/// Outcome at a single horizon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HorizonLabel {
    pub horizon_mins: i64,
    pub forward_return: f64,
    pub direction: Direction,
}

/// Labels for one trade across all configured horizons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLabel {
    pub symbol: String,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub side: Side,

    /// One entry per horizon that had a future bar available.
    pub horizons: Vec<HorizonLabel>,

    /// Best excursion achieved after entry, as a non-negative fraction.
    pub max_favorable_excursion: Option<f64>,
    /// Worst excursion suffered after entry, as a non-negative fraction.
    pub max_adverse_excursion: Option<f64>,

    // Realized outcome, filled in when the trade closes.
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub realized_return: Option<f64>,
    pub hold_duration_mins: Option<i64>,
}

impl TradeLabel {
    /// Label at a specific horizon, if it was computable.
    pub fn at_horizon(&self, horizon_mins: i64) -> Option<&HorizonLabel> {
        self.horizons.iter().find(|h| h.horizon_mins == horizon_mins)
    }
}

/// Generates forward labels from its own bounded per-symbol price history.
pub struct LabelGenerator {
    horizons_mins: Vec<i64>,
    direction_threshold: f64,
    history: RwLock<HashMap<String, Vec<PriceBar>>>,
    max_history: usize,
}

impl LabelGenerator {
    /// `direction_threshold` is a fraction (0.001 = 0.1%).
    pub fn new(horizons_mins: Vec<i64>, direction_threshold: f64) -> Self {
        info!(
            horizons = ?horizons_mins,
            direction_threshold, "label generator initialised"
        );
        Self {
            horizons_mins,
            direction_threshold,
            history: RwLock::new(HashMap::new()),
            max_history: 500,
        }
    }

    /// Record a bar for later label lookups.
    pub fn add_bar(&self, bar: PriceBar) {
        let mut map = self.history.write();
        let list = map.entry(bar.symbol.clone()).or_default();
        list.push(bar);
        if list.len() > self.max_history {
            let excess = list.len() - self.max_history;
            list.drain(..excess);
        }
    }

    /// Generate labels for a trade entered at `entry_time` / `entry_price`.
    pub fn generate(
        &self,
        symbol: &str,
        entry_time: DateTime<Utc>,
        entry_price: f64,
        side: Side,
    ) -> TradeLabel {
        let mut label = TradeLabel {
            symbol: symbol.to_string(),
            entry_time,
            entry_price,
            side,
            horizons: Vec::new(),
            max_favorable_excursion: None,
            max_adverse_excursion: None,
            exit_time: None,
            exit_price: None,
            realized_return: None,
            hold_duration_mins: None,
        };

        let map = self.history.read();
        let Some(bars) = map.get(symbol) else {
            return label;
        };
        let Some(entry_idx) = closest_index(bars, entry_time) else {
            return label;
        };

        for &horizon in &self.horizons_mins {
            let future_time = entry_time + Duration::minutes(horizon);
            let Some(future_idx) = closest_index(bars, future_time) else {
                continue;
            };
            // The future bar must actually be after the entry bar, otherwise
            // the horizon has no data yet and the label stays absent.
            if future_idx <= entry_idx {
                continue;
            }
            let future_price = bars[future_idx].close;
            let forward_return = signed_return(entry_price, future_price, side);
            label.horizons.push(HorizonLabel {
                horizon_mins: horizon,
                forward_return,
                direction: self.classify(forward_return),
            });
        }

        let (mfe, mae) = excursions(bars, entry_idx, entry_price, side);
        label.max_favorable_excursion = mfe;
        label.max_adverse_excursion = mae;
        label
    }

    /// Fill in the realized outcome once the trade has closed.
    pub fn update_outcome(
        &self,
        label: &mut TradeLabel,
        exit_time: DateTime<Utc>,
        exit_price: f64,
    ) {
        label.exit_time = Some(exit_time);
        label.exit_price = Some(exit_price);
        label.realized_return = Some(signed_return(label.entry_price, exit_price, label.side));
        label.hold_duration_mins =
            Some((exit_time - label.entry_time).num_seconds() / 60);
    }

    fn classify(&self, forward_return: f64) -> Direction {
        if forward_return > self.direction_threshold {
            Direction::Up
        } else if forward_return < -self.direction_threshold {
            Direction::Down
        } else {
            Direction::Flat
        }
    }
}

/// Return from the trade's perspective: positive when the side profited.
fn signed_return(entry: f64, exit: f64, side: Side) -> f64 {
    if entry == 0.0 {
        return 0.0;
    }
    match side {
        Side::Buy => (exit - entry) / entry,
        Side::Sell => (entry - exit) / entry,
    }
}

/// Index of the bar whose timestamp is closest to `target`.
fn closest_index(bars: &[PriceBar], target: DateTime<Utc>) -> Option<usize> {
    if bars.is_empty() {
        return None;
    }
    let mut best = 0;
    let mut best_diff = i64::MAX;
    for (i, bar) in bars.iter().enumerate() {
        let diff = (bar.timestamp - target).num_seconds().abs();
        if diff < best_diff {
            best_diff = diff;
            best = i;
        }
    }
    Some(best)
}

/// Max favorable and max adverse excursion over the bars after entry, both
/// returned as non-negative fractions. `None` when no bar follows entry.
fn excursions(
    bars: &[PriceBar],
    entry_idx: usize,
    entry_price: f64,
    side: Side,
) -> (Option<f64>, Option<f64>) {
    if entry_idx + 1 >= bars.len() || entry_price <= 0.0 {
        return (None, None);
    }
    let mut max_favorable = 0.0_f64;
    let mut min_excursion = 0.0_f64;
    for bar in &bars[entry_idx + 1..] {
        let excursion = signed_return(entry_price, bar.close, side);
        max_favorable = max_favorable.max(excursion);
        min_excursion = min_excursion.min(excursion);
    }
    (Some(max_favorable), Some(min_excursion.abs()))
}
