// =============================================================================
// Theory registry -- pluggable trading strategies
// =============================================================================
//
// A Theory turns a feature set into zero or more signals plus a position
// size multiplier. Theories are stateless across invocations; bookkeeping
// (enabled flag, signal count, last signal time) lives in the registry so
// implementations stay pure functions of the features.
// =============================================================================

pub mod breakout;
pub mod mean_reversion;
pub mod momentum;
pub mod news_shock;
pub mod vol_regime;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::features::FeatureSet;
use crate::types::Signal;

/// Static description of a theory for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TheoryInfo {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub horizons: Vec<i64>,
    pub typical_hold_time_mins: i64,
}

/// A trading theory: signal generation plus a risk model.
pub trait Theory: Send + Sync {
    /// Stable identifier used by the engine, allocator, and snapshots.
    fn theory_id(&self) -> &str;

    fn describe(&self) -> TheoryInfo;

    /// Produce zero or more signals for the feature set's symbol. Each
    /// signal's confidence must land in [0, 1].
    fn generate_signals(&self, features: &FeatureSet) -> Vec<Signal>;

    /// Position size multiplier in [0, 1] applied to the micro-trade
    /// notional by the engine.
    fn risk_multiplier(&self, features: &FeatureSet) -> f64;
}

/// Per-theory bookkeeping kept by the registry.
struct TheoryEntry {
    theory: Arc<dyn Theory>,
    enabled: AtomicBool,
    signal_count: AtomicU64,
    last_signal_time: RwLock<Option<DateTime<Utc>>>,
}

/// Runtime status of a registered theory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TheoryStatus {
    pub theory_id: String,
    pub enabled: bool,
    pub signal_count: u64,
    pub last_signal_time: Option<DateTime<Utc>>,
}

/// Owns the theory-id -> theory mapping and all bookkeeping.
pub struct TheoryRegistry {
    theories: RwLock<HashMap<String, Arc<TheoryEntry>>>,
}

impl TheoryRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            theories: RwLock::new(HashMap::new()),
        }
    }

    /// Registry pre-loaded with the five builtin theories.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(mean_reversion::MeanReversionTheory::default()));
        registry.register(Arc::new(breakout::BreakoutTheory::default()));
        registry.register(Arc::new(news_shock::NewsShockGuardTheory::default()));
        registry.register(Arc::new(vol_regime::VolatilityRegimeTheory::default()));
        registry.register(Arc::new(momentum::IntradayMomentumTheory::default()));
        registry
    }

    /// Register (or replace) a theory. New theories start enabled.
    pub fn register(&self, theory: Arc<dyn Theory>) {
        let id = theory.theory_id().to_string();
        let entry = Arc::new(TheoryEntry {
            theory,
            enabled: AtomicBool::new(true),
            signal_count: AtomicU64::new(0),
            last_signal_time: RwLock::new(None),
        });
        self.theories.write().insert(id.clone(), entry);
        info!(theory_id = %id, "theory registered");
    }

    pub fn get(&self, theory_id: &str) -> Option<Arc<dyn Theory>> {
        self.theories
            .read()
            .get(theory_id)
            .map(|e| e.theory.clone())
    }

    /// Identifiers of every registered theory.
    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.theories.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Identifiers of the currently enabled theories.
    pub fn enabled_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .theories
            .read()
            .iter()
            .filter(|(_, e)| e.enabled.load(Ordering::Relaxed))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_enabled(&self, theory_id: &str) -> bool {
        self.theories
            .read()
            .get(theory_id)
            .map(|e| e.enabled.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn enable(&self, theory_id: &str) -> bool {
        self.set_enabled(theory_id, true)
    }

    pub fn disable(&self, theory_id: &str) -> bool {
        self.set_enabled(theory_id, false)
    }

    fn set_enabled(&self, theory_id: &str, enabled: bool) -> bool {
        match self.theories.read().get(theory_id) {
            Some(entry) => {
                entry.enabled.store(enabled, Ordering::Relaxed);
                info!(theory_id, enabled, "theory enabled flag changed");
                true
            }
            None => false,
        }
    }

    /// Descriptions of every registered theory keyed by id.
    pub fn describe_all(&self) -> HashMap<String, TheoryInfo> {
        self.theories
            .read()
            .iter()
            .map(|(id, e)| (id.clone(), e.theory.describe()))
            .collect()
    }

    /// Runtime status of every registered theory.
    pub fn statuses(&self) -> Vec<TheoryStatus> {
        let mut out: Vec<TheoryStatus> = self
            .theories
            .read()
            .iter()
            .map(|(id, e)| TheoryStatus {
                theory_id: id.clone(),
                enabled: e.enabled.load(Ordering::Relaxed),
                signal_count: e.signal_count.load(Ordering::Relaxed),
                last_signal_time: *e.last_signal_time.read(),
            })
            .collect();
        out.sort_by(|a, b| a.theory_id.cmp(&b.theory_id));
        out
    }

    /// Run every enabled theory against `features` and collect the signals,
    /// updating per-theory bookkeeping.
    pub fn generate_signals(&self, features: &FeatureSet) -> Vec<Signal> {
        let entries: Vec<Arc<TheoryEntry>> = self
            .theories
            .read()
            .values()
            .filter(|e| e.enabled.load(Ordering::Relaxed))
            .cloned()
            .collect();

        let mut signals = Vec::new();
        for entry in entries {
            let produced = entry.theory.generate_signals(features);
            if !produced.is_empty() {
                entry
                    .signal_count
                    .fetch_add(produced.len() as u64, Ordering::Relaxed);
                *entry.last_signal_time.write() = produced.last().map(|s| s.timestamp);
            }
            signals.extend(produced);
        }
        signals
    }

    /// Size multiplier for one theory, 0.0 for unknown ids.
    pub fn risk_multiplier(&self, theory_id: &str, features: &FeatureSet) -> f64 {
        self.theories
            .read()
            .get(theory_id)
            .map(|e| e.theory.risk_multiplier(features).clamp(0.0, 1.0))
            .unwrap_or(0.0)
    }
}

impl Default for TheoryRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{TrendRegime, VolRegime};

    fn oversold_features() -> FeatureSet {
        FeatureSet {
            symbol: "AAPL".to_string(),
            price: 95.0,
            volume: 10_000.0,
            rsi: Some(22.0),
            bollinger_upper: Some(110.0),
            bollinger_lower: Some(96.0),
            sma_5: Some(100.0),
            sma_20: Some(101.0),
            sma_50: Some(102.0),
            atr: Some(1.0),
            vol_regime: VolRegime::Normal,
            trend_regime: TrendRegime::Sideways,
            ..FeatureSet::default()
        }
    }

    #[test]
    fn builtins_are_registered() {
        let registry = TheoryRegistry::with_builtins();
        let ids = registry.list_ids();
        assert_eq!(
            ids,
            vec![
                "breakout",
                "intraday_momentum",
                "mean_revert",
                "news_shock_guard",
                "vol_regime"
            ]
        );
        assert_eq!(registry.enabled_ids().len(), 5);
    }

    #[test]
    fn disable_removes_from_enabled_set() {
        let registry = TheoryRegistry::with_builtins();
        assert!(registry.disable("breakout"));
        assert!(!registry.is_enabled("breakout"));
        assert!(!registry.enabled_ids().contains(&"breakout".to_string()));
        assert!(registry.enable("breakout"));
        assert!(registry.is_enabled("breakout"));
    }

    #[test]
    fn enable_unknown_theory_is_false() {
        let registry = TheoryRegistry::with_builtins();
        assert!(!registry.enable("does_not_exist"));
        assert!(!registry.disable("does_not_exist"));
    }

    #[test]
    fn generate_signals_updates_bookkeeping() {
        let registry = TheoryRegistry::with_builtins();
        let signals = registry.generate_signals(&oversold_features());
        assert!(
            signals.iter().any(|s| s.theory_id == "mean_revert"),
            "oversold features should trigger mean reversion"
        );

        let status = registry
            .statuses()
            .into_iter()
            .find(|s| s.theory_id == "mean_revert")
            .unwrap();
        assert!(status.signal_count >= 1);
        assert!(status.last_signal_time.is_some());
    }

    #[test]
    fn disabled_theory_generates_nothing() {
        let registry = TheoryRegistry::with_builtins();
        registry.disable("mean_revert");
        let signals = registry.generate_signals(&oversold_features());
        assert!(!signals.iter().any(|s| s.theory_id == "mean_revert"));
    }

    #[test]
    fn all_confidences_in_unit_interval() {
        let registry = TheoryRegistry::with_builtins();
        let signals = registry.generate_signals(&oversold_features());
        for sig in signals {
            assert!((0.0..=1.0).contains(&sig.confidence));
        }
    }

    #[test]
    fn risk_multiplier_unknown_theory_is_zero() {
        let registry = TheoryRegistry::with_builtins();
        assert_eq!(
            registry.risk_multiplier("nope", &oversold_features()),
            0.0
        );
    }

    #[test]
    fn describe_all_covers_every_theory() {
        let registry = TheoryRegistry::with_builtins();
        let descriptions = registry.describe_all();
        assert_eq!(descriptions.len(), 5);
        for info in descriptions.values() {
            assert!(!info.name.is_empty());
            assert!(!info.horizons.is_empty());
        }
    }
}
