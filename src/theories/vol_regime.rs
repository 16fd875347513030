// =============================================================================
// Volatility regime -- trade regime transitions with conservative sizing
// =============================================================================

use serde_json::json;

use crate::features::{FeatureSet, VolRegime};
use crate::theories::{Theory, TheoryInfo};
use crate::types::{Side, Signal};

/// Long volatility in a high regime, short it in a low regime.
pub struct VolatilityRegimeTheory {
    high_confidence: f64,
    low_confidence: f64,
}

impl Default for VolatilityRegimeTheory {
    fn default() -> Self {
        Self {
            high_confidence: 0.7,
            low_confidence: 0.6,
        }
    }
}

impl Theory for VolatilityRegimeTheory {
    fn theory_id(&self) -> &str {
        "vol_regime"
    }

    fn describe(&self) -> TheoryInfo {
        TheoryInfo {
            name: "Volatility Regime".to_string(),
            description: "Volatility regime transition trades".to_string(),
            parameters: json!({
                "high_confidence": self.high_confidence,
                "low_confidence": self.low_confidence,
            }),
            horizons: vec![15, 60],
            typical_hold_time_mins: 45,
        }
    }

    fn generate_signals(&self, features: &FeatureSet) -> Vec<Signal> {
        match features.vol_regime {
            VolRegime::High if features.atr.unwrap_or(0.0) > 0.0 => {
                vec![Signal::new(
                    self.theory_id(),
                    &features.symbol,
                    Side::Buy,
                    self.high_confidence,
                    60,
                    features.clone(),
                )]
            }
            VolRegime::Low => {
                vec![Signal::new(
                    self.theory_id(),
                    &features.symbol,
                    Side::Sell,
                    self.low_confidence,
                    60,
                    features.clone(),
                )]
            }
            _ => Vec::new(),
        }
    }

    fn risk_multiplier(&self, features: &FeatureSet) -> f64 {
        // Conservative base for regime trades; a clear regime earns a bump.
        let mut size: f64 = 0.8;
        if matches!(features.vol_regime, VolRegime::High | VolRegime::Low) {
            size *= 1.2;
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

    fn features(regime: VolRegime, atr: Option<f64>) -> FeatureSet {
        FeatureSet {
            symbol: "SPY".to_string(),
            price: 400.0,
            atr,
            vol_regime: regime,
            ..FeatureSet::default()
        }
    }

    #[test]
    fn high_vol_with_atr_buys() {
        let theory = VolatilityRegimeTheory::default();
        let signals = theory.generate_signals(&features(VolRegime::High, Some(2.0)));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Buy);
        assert_eq!(signals[0].horizon_mins, 60);
    }

    #[test]
    fn high_vol_without_atr_is_silent() {
        let theory = VolatilityRegimeTheory::default();
        assert!(theory
            .generate_signals(&features(VolRegime::High, None))
            .is_empty());
    }

    #[test]
    fn low_vol_sells() {
        let theory = VolatilityRegimeTheory::default();
        let signals = theory.generate_signals(&features(VolRegime::Low, None));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Sell);
    }

    #[test]
    fn normal_regime_is_silent() {
        let theory = VolatilityRegimeTheory::default();
        assert!(theory
            .generate_signals(&features(VolRegime::Normal, Some(2.0)))
            .is_empty());
    }

    #[test]
    fn sizing_stays_conservative() {
        let theory = VolatilityRegimeTheory::default();
        let m = theory.risk_multiplier(&features(VolRegime::High, Some(2.0)));
        assert!((m - 0.96).abs() < 1e-9);
        let m = theory.risk_multiplier(&features(VolRegime::Normal, None));
        assert!((m - 0.8).abs() < 1e-9);
    }
}
