// =============================================================================
// Intraday momentum -- short-horizon momentum scaled by trend alignment
// =============================================================================

use serde_json::json;

use crate::features::{FeatureSet, TrendRegime};
use crate::theories::{Theory, TheoryInfo};
use crate::types::{Side, Signal};

/// Signed momentum (price vs SMA-5) above a threshold in either direction.
pub struct IntradayMomentumTheory {
    /// Fractional momentum that triggers a signal.
    momentum_threshold: f64,
}

impl Default for IntradayMomentumTheory {
    fn default() -> Self {
        Self {
            momentum_threshold: 0.01,
        }
    }
}

impl IntradayMomentumTheory {
    fn momentum(features: &FeatureSet) -> Option<f64> {
        let sma_5 = features.sma_5?;
        if sma_5 <= 0.0 {
            return None;
        }
        Some((features.price - sma_5) / sma_5)
    }
}

impl Theory for IntradayMomentumTheory {
    fn theory_id(&self) -> &str {
        "intraday_momentum"
    }

    fn describe(&self) -> TheoryInfo {
        TheoryInfo {
            name: "Intraday Momentum".to_string(),
            description: "Short-horizon momentum vs the 5-bar mean".to_string(),
            parameters: json!({ "momentum_threshold": self.momentum_threshold }),
            horizons: vec![5, 15],
            typical_hold_time_mins: 8,
        }
    }

    fn generate_signals(&self, features: &FeatureSet) -> Vec<Signal> {
        let Some(momentum) = Self::momentum(features) else {
            return Vec::new();
        };

        if momentum > self.momentum_threshold {
            let confidence = (momentum / self.momentum_threshold).min(1.0);
            vec![Signal::new(
                self.theory_id(),
                &features.symbol,
                Side::Buy,
                confidence,
                5,
                features.clone(),
            )]
        } else if momentum < -self.momentum_threshold {
            let confidence = (momentum.abs() / self.momentum_threshold).min(1.0);
            vec![Signal::new(
                self.theory_id(),
                &features.symbol,
                Side::Sell,
                confidence,
                5,
                features.clone(),
            )]
        } else {
            Vec::new()
        }
    }

    fn risk_multiplier(&self, features: &FeatureSet) -> f64 {
        let mut size: f64 = 1.0;
        let momentum = Self::momentum(features).unwrap_or(0.0);

        let aligned = (momentum > 0.0 && features.trend_regime == TrendRegime::Up)
            || (momentum < 0.0 && features.trend_regime == TrendRegime::Down);
        if aligned {
            size *= 1.3;
        }
        if features.trend_regime == TrendRegime::Sideways {
            size *= 0.7;
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

    fn features(price: f64, sma_5: Option<f64>, trend: TrendRegime) -> FeatureSet {
        FeatureSet {
            symbol: "NVDA".to_string(),
            price,
            sma_5,
            trend_regime: trend,
            ..FeatureSet::default()
        }
    }

    #[test]
    fn positive_momentum_buys() {
        let theory = IntradayMomentumTheory::default();
        let signals =
            theory.generate_signals(&features(102.0, Some(100.0), TrendRegime::Up));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Buy);
        assert_eq!(signals[0].confidence, 1.0);
    }

    #[test]
    fn negative_momentum_sells() {
        let theory = IntradayMomentumTheory::default();
        let signals =
            theory.generate_signals(&features(98.0, Some(100.0), TrendRegime::Down));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Sell);
    }

    #[test]
    fn weak_momentum_is_silent() {
        let theory = IntradayMomentumTheory::default();
        assert!(theory
            .generate_signals(&features(100.5, Some(100.0), TrendRegime::Sideways))
            .is_empty());
    }

    #[test]
    fn missing_sma_is_silent() {
        let theory = IntradayMomentumTheory::default();
        assert!(theory
            .generate_signals(&features(102.0, None, TrendRegime::Up))
            .is_empty());
    }

    #[test]
    fn sideways_tape_shrinks_size() {
        let theory = IntradayMomentumTheory::default();
        let m = theory.risk_multiplier(&features(100.2, Some(100.0), TrendRegime::Sideways));
        assert!((m - 0.7).abs() < 1e-9);
    }

    #[test]
    fn aligned_momentum_is_capped_at_one() {
        let theory = IntradayMomentumTheory::default();
        let m = theory.risk_multiplier(&features(102.0, Some(100.0), TrendRegime::Up));
        assert_eq!(m, 1.0);
    }
}
