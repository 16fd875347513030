// =============================================================================
// Breakout -- price escaping the SMA-20 band with volume
// =============================================================================

use serde_json::json;

use crate::features::{FeatureSet, TrendRegime};
use crate::theories::{Theory, TheoryInfo};
use crate::types::{Side, Signal};

/// BUY when price exceeds SMA-20 by the configured threshold with non-zero
/// volume; mirror for SELL.
pub struct BreakoutTheory {
    /// Fractional distance from SMA-20 that counts as a breakout.
    breakout_threshold: f64,
}

impl Default for BreakoutTheory {
    fn default() -> Self {
        Self {
            breakout_threshold: 0.02,
        }
    }
}

impl Theory for BreakoutTheory {
    fn theory_id(&self) -> &str {
        "breakout"
    }

    fn describe(&self) -> TheoryInfo {
        TheoryInfo {
            name: "Breakout".to_string(),
            description: "Price and volume breakout through the SMA-20 band".to_string(),
            parameters: json!({ "breakout_threshold": self.breakout_threshold }),
            horizons: vec![5, 15, 60],
            typical_hold_time_mins: 30,
        }
    }

    fn generate_signals(&self, features: &FeatureSet) -> Vec<Signal> {
        let Some(sma_20) = features.sma_20 else {
            return Vec::new();
        };
        if sma_20 <= 0.0 || features.volume <= 0.0 {
            return Vec::new();
        }

        let mut signals = Vec::new();

        if features.price > sma_20 * (1.0 + self.breakout_threshold) {
            let magnitude = (features.price - sma_20) / sma_20;
            let confidence = (magnitude / self.breakout_threshold).min(1.0);
            signals.push(Signal::new(
                self.theory_id(),
                &features.symbol,
                Side::Buy,
                confidence,
                30,
                features.clone(),
            ));
        } else if features.price < sma_20 * (1.0 - self.breakout_threshold) {
            let magnitude = (sma_20 - features.price) / sma_20;
            let confidence = (magnitude / self.breakout_threshold).min(1.0);
            signals.push(Signal::new(
                self.theory_id(),
                &features.symbol,
                Side::Sell,
                confidence,
                30,
                features.clone(),
            ));
        }

        signals
    }

    fn risk_multiplier(&self, features: &FeatureSet) -> f64 {
        let mut size = 1.0;

        if matches!(features.trend_regime, TrendRegime::Up | TrendRegime::Down) {
            size *= 1.3;
        }

        // Higher ATR relative to price means a wider stop and a smaller size.
        if let Some(atr) = features.atr {
            if atr > 0.0 && features.price > 0.0 {
                let atr_factor = (atr / (features.price * 0.02)).min(2.0).max(1e-6);
                size /= atr_factor.max(1.0);
            }
        }

        size.min(1.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn features(price: f64, sma_20: Option<f64>, volume: f64) -> FeatureSet {
        FeatureSet {
            symbol: "MSFT".to_string(),
            price,
            volume,
            sma_20,
            ..FeatureSet::default()
        }
    }

    #[test]
    fn upside_breakout_buys() {
        let theory = BreakoutTheory::default();
        let signals = theory.generate_signals(&features(103.0, Some(100.0), 5_000.0));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Buy);
        assert_eq!(signals[0].confidence, 1.0);
    }

    #[test]
    fn downside_breakout_sells() {
        let theory = BreakoutTheory::default();
        let signals = theory.generate_signals(&features(97.0, Some(100.0), 5_000.0));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Sell);
    }

    #[test]
    fn inside_band_is_silent() {
        let theory = BreakoutTheory::default();
        assert!(theory
            .generate_signals(&features(101.0, Some(100.0), 5_000.0))
            .is_empty());
    }

    #[test]
    fn zero_volume_blocks_signal() {
        let theory = BreakoutTheory::default();
        assert!(theory
            .generate_signals(&features(103.0, Some(100.0), 0.0))
            .is_empty());
    }

    #[test]
    fn missing_sma_blocks_signal() {
        let theory = BreakoutTheory::default();
        assert!(theory
            .generate_signals(&features(103.0, None, 5_000.0))
            .is_empty());
    }
}
