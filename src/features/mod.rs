// =============================================================================
// Feature pipeline -- deterministic market features from the rolling window
// =============================================================================
//
// The FeatureComputer reads the shared BarWindow and produces a typed
// FeatureSet per symbol: last close, SMAs, RSI, Bollinger bounds, ATR, and
// volatility / trend regime tags. Lookback-dependent features are `None`
// when the window is too short, never zero.
//
// All computation is deterministic and side-effect-free except for the
// incremental EMA cache keyed by (symbol, period).
// =============================================================================

pub mod indicators;
pub mod labels;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::market_data::BarWindow;

// ---------------------------------------------------------------------------
// Regime tags
// ---------------------------------------------------------------------------

/// Annualized-volatility regime bands: < 0.15 low, 0.15..0.30 normal,
/// >= 0.30 high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolRegime {
    Low,
    Normal,
    High,
}

impl Default for VolRegime {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for VolRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendRegime {
    Up,
    Down,
    Sideways,
}

impl Default for TrendRegime {
    fn default() -> Self {
        Self::Sideways
    }
}

impl std::fmt::Display for TrendRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
            Self::Sideways => write!(f, "sideways"),
        }
    }
}

// ---------------------------------------------------------------------------
// FeatureSet
// ---------------------------------------------------------------------------

/// Names and order of the numeric features exposed to the learner.
pub const LEARNING_FEATURE_NAMES: [&str; 9] = [
    "price", "sma_5", "sma_20", "sma_50", "rsi", "bollinger_upper", "bollinger_lower",
    "atr", "order_flow_imbalance",
];

/// Typed market feature set for one symbol at one instant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureSet {
    pub symbol: String,
    pub timestamp: Option<DateTime<Utc>>,

    // Price snapshot
    pub price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,

    // Lookback-dependent indicators -- absent when the window is short.
    pub sma_5: Option<f64>,
    pub sma_20: Option<f64>,
    pub sma_50: Option<f64>,
    pub rsi: Option<f64>,
    pub bollinger_upper: Option<f64>,
    pub bollinger_lower: Option<f64>,
    pub atr: Option<f64>,

    // Regime tags
    pub vol_regime: VolRegime,
    pub trend_regime: TrendRegime,

    // Microstructure estimates
    pub bid_ask_spread: f64,
    pub order_flow_imbalance: f64,

    // News inputs (supplied upstream; neutral when no provider is wired)
    pub news_sentiment: f64,
    pub news_urgency: f64,
}

impl FeatureSet {
    /// Fixed-order numeric vector for the learner. Absent indicators map to
    /// neutral values (price for SMAs and bands, 50 for RSI, 0 otherwise) so
    /// the vector dimension is stable across warm-up.
    pub fn learning_vector(&self) -> Vec<f64> {
        vec![
            self.price,
            self.sma_5.unwrap_or(self.price),
            self.sma_20.unwrap_or(self.price),
            self.sma_50.unwrap_or(self.price),
            self.rsi.unwrap_or(50.0),
            self.bollinger_upper.unwrap_or(self.price),
            self.bollinger_lower.unwrap_or(self.price),
            self.atr.unwrap_or(0.0),
            self.order_flow_imbalance,
        ]
    }

    /// Name -> value map of the features that are actually present.
    pub fn to_map(&self) -> HashMap<String, f64> {
        let mut m = HashMap::new();
        m.insert("price".to_string(), self.price);
        m.insert("volume".to_string(), self.volume);
        if let Some(v) = self.sma_5 {
            m.insert("sma_5".to_string(), v);
        }
        if let Some(v) = self.sma_20 {
            m.insert("sma_20".to_string(), v);
        }
        if let Some(v) = self.sma_50 {
            m.insert("sma_50".to_string(), v);
        }
        if let Some(v) = self.rsi {
            m.insert("rsi".to_string(), v);
        }
        if let Some(v) = self.bollinger_upper {
            m.insert("bollinger_upper".to_string(), v);
        }
        if let Some(v) = self.bollinger_lower {
            m.insert("bollinger_lower".to_string(), v);
        }
        if let Some(v) = self.atr {
            m.insert("atr".to_string(), v);
        }
        m.insert("bid_ask_spread".to_string(), self.bid_ask_spread);
        m.insert(
            "order_flow_imbalance".to_string(),
            self.order_flow_imbalance,
        );
        m
    }
}

// ---------------------------------------------------------------------------
// FeatureComputer
// ---------------------------------------------------------------------------

const VOL_HIGH_THRESHOLD: f64 = 0.30;
const VOL_LOW_THRESHOLD: f64 = 0.15;
/// Trading minutes per year used to annualize one-minute bar volatility.
const ANNUALIZATION_FACTOR: f64 = 252.0;

/// Computes technical features over the shared rolling window.
pub struct FeatureComputer {
    window: Arc<BarWindow>,
    ema_cache: Mutex<HashMap<(String, usize), f64>>,
}

impl FeatureComputer {
    pub fn new(window: Arc<BarWindow>) -> Self {
        Self {
            window,
            ema_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Compute the feature set for `symbol`, or `None` when no bars exist.
    pub fn compute_features(&self, symbol: &str) -> Option<FeatureSet> {
        let bars = self.window.all(symbol);
        let latest = bars.last()?.clone();
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

        let sma_5 = indicators::sma(&closes, 5);
        let sma_20 = indicators::sma(&closes, 20);
        let sma_50 = indicators::sma(&closes, 50);

        let rsi = if closes.len() >= 15 {
            indicators::rsi(&closes[closes.len() - 15..])
        } else {
            None
        };

        let (bollinger_upper, bollinger_lower) = match indicators::bollinger(&closes, 20, 2.0) {
            Some((u, _, l)) => (Some(u), Some(l)),
            None => (None, None),
        };

        let atr = if bars.len() >= 15 {
            indicators::atr(&bars[bars.len() - 15..])
        } else {
            None
        };

        // Keep the incremental EMA cache warm for the standard periods.
        self.update_ema(symbol, &closes, 12);
        self.update_ema(symbol, &closes, 26);

        let vol_regime = classify_vol_regime(&closes);
        let trend_regime = classify_trend_regime(latest.close, sma_5, sma_20, sma_50);
        let bid_ask_spread = estimate_spread(&latest);
        let order_flow_imbalance = estimate_flow_imbalance(&bars);

        Some(FeatureSet {
            symbol: symbol.to_string(),
            timestamp: Some(latest.timestamp),
            price: latest.close,
            open: latest.open,
            high: latest.high,
            low: latest.low,
            volume: latest.volume,
            sma_5,
            sma_20,
            sma_50,
            rsi,
            bollinger_upper,
            bollinger_lower,
            atr,
            vol_regime,
            trend_regime,
            bid_ask_spread,
            order_flow_imbalance,
            news_sentiment: 0.0,
            news_urgency: 0.0,
        })
    }

    /// Incrementally-cached EMA. Seeds from the SMA of the first `period`
    /// closes on the first call, then folds in only the newest close.
    pub fn ema(&self, symbol: &str, period: usize) -> Option<f64> {
        let cache = self.ema_cache.lock();
        cache.get(&(symbol.to_string(), period)).copied()
    }

    fn update_ema(&self, symbol: &str, closes: &[f64], period: usize) {
        if closes.len() < period {
            return;
        }
        let alpha = 2.0 / (period as f64 + 1.0);
        let key = (symbol.to_string(), period);
        let mut cache = self.ema_cache.lock();

        let value = match cache.get(&key) {
            Some(prev) => alpha * closes[closes.len() - 1] + (1.0 - alpha) * prev,
            None => {
                // Seed with SMA then roll forward through the history once.
                let mut ema = closes[..period].iter().sum::<f64>() / period as f64;
                for &c in &closes[period..] {
                    ema = alpha * c + (1.0 - alpha) * ema;
                }
                ema
            }
        };
        cache.insert(key, value);
    }
}

// ---------------------------------------------------------------------------
// Classification helpers
// ---------------------------------------------------------------------------

/// Annualized standard deviation of the last 20 returns, banded.
fn classify_vol_regime(closes: &[f64]) -> VolRegime {
    if closes.len() < 21 {
        return VolRegime::Normal;
    }
    let recent = &closes[closes.len() - 21..];
    let rets = indicators::returns(recent);
    if rets.is_empty() {
        return VolRegime::Normal;
    }
    let vol = indicators::std_dev(&rets) * ANNUALIZATION_FACTOR.sqrt();
    if vol >= VOL_HIGH_THRESHOLD {
        VolRegime::High
    } else if vol < VOL_LOW_THRESHOLD {
        VolRegime::Low
    } else {
        VolRegime::Normal
    }
}

/// Trend from SMA stack alignment: price above an ascending 5 > 20 > 50
/// stack is up, the mirror is down, anything else sideways.
fn classify_trend_regime(
    price: f64,
    sma_5: Option<f64>,
    sma_20: Option<f64>,
    sma_50: Option<f64>,
) -> TrendRegime {
    let (Some(s5), Some(s20), Some(s50)) = (sma_5, sma_20, sma_50) else {
        return TrendRegime::Sideways;
    };
    if s5 > s20 && s20 > s50 && price > s5 {
        TrendRegime::Up
    } else if s5 < s20 && s20 < s50 && price < s5 {
        TrendRegime::Down
    } else {
        TrendRegime::Sideways
    }
}

/// Spread estimate from the last bar's high-low range, capped at 5%.
fn estimate_spread(bar: &crate::market_data::PriceBar) -> f64 {
    if bar.high == bar.low || bar.close <= 0.0 {
        return 0.01;
    }
    let range_pct = (bar.high - bar.low) / bar.close;
    (range_pct * 0.3).min(0.05)
}

/// Order-flow imbalance proxy from the last two bars' price change and
/// volume ratio, clamped to [-1, 1].
fn estimate_flow_imbalance(bars: &[crate::market_data::PriceBar]) -> f64 {
    if bars.len() < 2 {
        return 0.0;
    }
    let latest = &bars[bars.len() - 1];
    let prev = &bars[bars.len() - 2];
    let price_change = latest.close - prev.close;
    let volume_ratio = latest.volume / prev.volume.max(1.0);

    if price_change > 0.0 {
        (volume_ratio - 1.0).min(1.0)
    } else if price_change < 0.0 {
        (-(volume_ratio - 1.0)).max(-1.0)
    } else {
        0.0
    }
}
