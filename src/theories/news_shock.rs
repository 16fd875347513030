// =============================================================================
// News shock guard -- defensive selling on negative high-urgency news
// =============================================================================

use serde_json::json;

use crate::features::{FeatureSet, VolRegime};
use crate::theories::{Theory, TheoryInfo};
use crate::types::{Side, Signal};

/// Defensive SELL when news sentiment drops below the threshold while
/// urgency is high.
pub struct NewsShockGuardTheory {
    sentiment_threshold: f64,
    urgency_threshold: f64,
    volatility_amplifier: f64,
}

impl Default for NewsShockGuardTheory {
    fn default() -> Self {
        Self {
            sentiment_threshold: -0.5,
            urgency_threshold: 0.7,
            volatility_amplifier: 1.5,
        }
    }
}

impl Theory for NewsShockGuardTheory {
    fn theory_id(&self) -> &str {
        "news_shock_guard"
    }

    fn describe(&self) -> TheoryInfo {
        TheoryInfo {
            name: "News Shock Guard".to_string(),
            description: "Defensive selling into negative news shocks".to_string(),
            parameters: json!({
                "sentiment_threshold": self.sentiment_threshold,
                "urgency_threshold": self.urgency_threshold,
                "volatility_amplifier": self.volatility_amplifier,
            }),
            horizons: vec![5, 10],
            typical_hold_time_mins: 10,
        }
    }

    fn generate_signals(&self, features: &FeatureSet) -> Vec<Signal> {
        if features.news_sentiment <= self.sentiment_threshold
            && features.news_urgency >= self.urgency_threshold
        {
            let confidence = (features.news_sentiment.abs() * features.news_urgency).min(1.0);
            return vec![Signal::new(
                self.theory_id(),
                &features.symbol,
                Side::Sell,
                confidence,
                5,
                features.clone(),
            )];
        }
        Vec::new()
    }

    fn risk_multiplier(&self, features: &FeatureSet) -> f64 {
        let mut size = 1.0;

        if features.news_urgency > self.urgency_threshold {
            size *= 1.0 + features.news_urgency;
        }
        // Defensive trades benefit from volatility.
        if features.vol_regime == VolRegime::High {
            size *= self.volatility_amplifier;
        }

        size.min(1.0)
    }
}
