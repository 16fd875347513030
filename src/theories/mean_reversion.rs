// =============================================================================
// Mean reversion -- RSI + Bollinger band snap-back
// =============================================================================

use serde_json::json;

use crate::features::{FeatureSet, TrendRegime, VolRegime};
use crate::theories::{Theory, TheoryInfo};
use crate::types::{Side, Signal};

/// BUY when RSI is oversold and price sits within a small delta of the lower
/// Bollinger band; SELL on the mirror condition.
pub struct MeanReversionTheory {
    rsi_oversold: f64,
    rsi_overbought: f64,
    /// Fractional tolerance around the band (0.02 = within 2%).
    bb_threshold: f64,
}

impl Default for MeanReversionTheory {
    fn default() -> Self {
        Self {
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            bb_threshold: 0.02,
        }
    }
}

impl Theory for MeanReversionTheory {
    fn theory_id(&self) -> &str {
        "mean_revert"
    }

    fn describe(&self) -> TheoryInfo {
        TheoryInfo {
            name: "Mean Reversion".to_string(),
            description: "RSI and Bollinger band mean reversion".to_string(),
            parameters: json!({
                "rsi_oversold": self.rsi_oversold,
                "rsi_overbought": self.rsi_overbought,
                "bb_threshold": self.bb_threshold,
            }),
            horizons: vec![5, 15, 30],
            typical_hold_time_mins: 15,
        }
    }

    fn generate_signals(&self, features: &FeatureSet) -> Vec<Signal> {
        let (Some(rsi), Some(bb_upper), Some(bb_lower)) =
            (features.rsi, features.bollinger_upper, features.bollinger_lower)
        else {
            return Vec::new();
        };

        let mut signals = Vec::new();

        if rsi <= self.rsi_oversold && features.price <= bb_lower * (1.0 + self.bb_threshold) {
            let confidence = ((self.rsi_oversold - rsi) / 10.0).min(1.0);
            signals.push(Signal::new(
                self.theory_id(),
                &features.symbol,
                Side::Buy,
                confidence,
                15,
                features.clone(),
            ));
        } else if rsi >= self.rsi_overbought
            && features.price >= bb_upper * (1.0 - self.bb_threshold)
        {
            let confidence = ((rsi - self.rsi_overbought) / 10.0).min(1.0);
            signals.push(Signal::new(
                self.theory_id(),
                &features.symbol,
                Side::Sell,
                confidence,
                15,
                features.clone(),
            ));
        }

        signals
    }

    fn risk_multiplier(&self, features: &FeatureSet) -> f64 {
        let mut size: f64 = 1.0;

        // Counter-trend entries shrink in turbulent or trending tape.
        match features.vol_regime {
            VolRegime::High => size *= 0.5,
            VolRegime::Low => size *= 1.2,
            VolRegime::Normal => {}
        }
        if matches!(features.trend_regime, TrendRegime::Up | TrendRegime::Down) {
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

    fn features(rsi: f64, price: f64) -> FeatureSet {
        FeatureSet {
            symbol: "AAPL".to_string(),
            price,
            rsi: Some(rsi),
            bollinger_upper: Some(110.0),
            bollinger_lower: Some(95.0),
            ..FeatureSet::default()
        }
    }

    #[test]
    fn oversold_near_lower_band_buys() {
        let theory = MeanReversionTheory::default();
        let signals = theory.generate_signals(&features(25.0, 95.5));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Buy);
        assert!((signals[0].confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn overbought_near_upper_band_sells() {
        let theory = MeanReversionTheory::default();
        let signals = theory.generate_signals(&features(78.0, 109.0));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Sell);
    }

    #[test]
    fn oversold_far_from_band_is_silent() {
        let theory = MeanReversionTheory::default();
        // RSI oversold but price well above the lower band.
        let signals = theory.generate_signals(&features(25.0, 105.0));
        assert!(signals.is_empty());
    }

    #[test]
    fn missing_indicators_yield_no_signal() {
        let theory = MeanReversionTheory::default();
        let fs = FeatureSet {
            symbol: "AAPL".to_string(),
            price: 95.0,
            ..FeatureSet::default()
        };
        assert!(theory.generate_signals(&fs).is_empty());
    }

    #[test]
    fn high_vol_trend_shrinks_size() {
        let theory = MeanReversionTheory::default();
        let fs = FeatureSet {
            vol_regime: crate::features::VolRegime::High,
            trend_regime: crate::features::TrendRegime::Up,
            ..FeatureSet::default()
        };
        assert!((theory.risk_multiplier(&fs) - 0.35).abs() < 1e-9);
    }
}
