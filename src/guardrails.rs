// =============================================================================
// Guardrails -- pre-trade risk gate with sticky emergency stop
// =============================================================================
//
// Nine enumerated violations checked against the current risk metrics:
// daily/weekly drawdown, gross exposure, single-trade risk, daily trade
// count, concurrent orders, cash reserve, regime kill-switches, and
// per-regime exposure limits. The emergency stop is sticky: once active,
// every check is disallowed until it is explicitly cleared.
//
// Counters persist to disk atomically (tmp + rename) and reload on boot.
// Daily and weekly counters reset automatically when the date rolls.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Violations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailViolation {
    DailyDrawdownExceeded,
    WeeklyDrawdownExceeded,
    ExposureLimitExceeded,
    SingleTradeRiskExceeded,
    DailyTradeLimitExceeded,
    ConcurrentOrderLimitExceeded,
    CashReserveInsufficient,
    RegimeKillSwitchActive,
    RegimeExposureLimitExceeded,
}

impl std::fmt::Display for GuardrailViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DailyDrawdownExceeded => "daily_drawdown_exceeded",
            Self::WeeklyDrawdownExceeded => "weekly_drawdown_exceeded",
            Self::ExposureLimitExceeded => "exposure_limit_exceeded",
            Self::SingleTradeRiskExceeded => "single_trade_risk_exceeded",
            Self::DailyTradeLimitExceeded => "daily_trade_limit_exceeded",
            Self::ConcurrentOrderLimitExceeded => "concurrent_order_limit_exceeded",
            Self::CashReserveInsufficient => "cash_reserve_insufficient",
            Self::RegimeKillSwitchActive => "regime_kill_switch_active",
            Self::RegimeExposureLimitExceeded => "regime_exposure_limit_exceeded",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Current portfolio risk and exposure metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub portfolio_value: f64,
    pub cash_balance: f64,
    pub gross_exposure: f64,
    pub net_exposure: f64,
    pub daily_pnl: f64,
    pub weekly_pnl: f64,
    pub daily_trades: u64,
    pub concurrent_orders: u64,
    pub last_updated: String,
    #[serde(default)]
    pub current_date: String,
    #[serde(default)]
    pub current_week: String,
}

impl RiskMetrics {
    fn new(portfolio_value: f64) -> Self {
        let now = Utc::now();
        Self {
            portfolio_value,
            cash_balance: portfolio_value,
            gross_exposure: 0.0,
            net_exposure: 0.0,
            daily_pnl: 0.0,
            weekly_pnl: 0.0,
            daily_trades: 0,
            concurrent_orders: 0,
            last_updated: now.to_rfc3339(),
            current_date: now.format("%Y-%m-%d").to_string(),
            current_week: format!("{}-W{:02}", now.iso_week().year(), now.iso_week().week()),
        }
    }

    pub fn gross_exposure_ratio(&self) -> f64 {
        self.gross_exposure / self.portfolio_value.max(1.0)
    }

    pub fn net_exposure_ratio(&self) -> f64 {
        self.net_exposure.abs() / self.portfolio_value.max(1.0)
    }

    pub fn daily_drawdown(&self) -> f64 {
        self.daily_pnl.min(0.0).abs() / self.portfolio_value.max(1.0)
    }

    pub fn weekly_drawdown(&self) -> f64 {
        self.weekly_pnl.min(0.0).abs() / self.portfolio_value.max(1.0)
    }

    pub fn cash_reserve_ratio(&self) -> f64 {
        self.cash_balance / self.portfolio_value.max(1.0)
    }
}

/// Result of one guardrail evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailCheck {
    pub allowed: bool,
    pub violations: Vec<GuardrailViolation>,
    pub risk_metrics: RiskMetrics,
    pub check_details: Value,
    pub check_timestamp: String,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailLimits {
    pub max_dd_day: f64,
    pub max_dd_week: f64,
    /// Gross exposure cap as a ratio of portfolio value.
    pub max_exposure: f64,
    /// Single-trade value cap as a ratio of portfolio value.
    pub max_single_trade_risk: f64,
    pub max_daily_trades: u64,
    pub max_concurrent_orders: u64,
    pub min_cash_reserve: f64,
    pub initial_portfolio_value: f64,
    /// Regime substrings that block all trading while present.
    pub regime_kill_switches: Vec<String>,
    /// Regime substring -> gross exposure ratio cap.
    pub regime_exposure_limits: HashMap<String, f64>,
    /// Persistence location; `None` disables persistence.
    pub data_path: Option<PathBuf>,
}

impl Default for GuardrailLimits {
    fn default() -> Self {
        let mut regime_exposure_limits = HashMap::new();
        regime_exposure_limits.insert("vol_hi".to_string(), 0.75);
        regime_exposure_limits.insert("liq_lo".to_string(), 0.50);
        Self {
            max_dd_day: 0.03,
            max_dd_week: 0.06,
            max_exposure: 1.50,
            max_single_trade_risk: 0.01,
            max_daily_trades: 100,
            max_concurrent_orders: 50,
            min_cash_reserve: 0.05,
            initial_portfolio_value: 1_000_000.0,
            regime_kill_switches: vec!["crash_mode".to_string(), "vol_hi_liq_lo".to_string()],
            regime_exposure_limits,
            data_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct PersistedState {
    metrics: RiskMetrics,
    violation_count: u64,
    check_count: u64,
    emergency_stop: bool,
    saved_at: String,
    version: u32,
}

/// The guardrail system. `check_trade` is pure with respect to the trade;
/// metric mutation happens only through the update operations.
pub struct GuardrailSystem {
    limits: GuardrailLimits,
    metrics: RwLock<RiskMetrics>,
    violation_count: AtomicU64,
    check_count: AtomicU64,
    persist_failures: AtomicU64,
    emergency_stop: AtomicBool,
}

impl GuardrailSystem {
    pub fn new(limits: GuardrailLimits) -> Self {
        let system = Self {
            metrics: RwLock::new(RiskMetrics::new(limits.initial_portfolio_value)),
            violation_count: AtomicU64::new(0),
            check_count: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            emergency_stop: AtomicBool::new(false),
            limits,
        };
        if let Err(e) = system.load_state() {
            // Missing or unreadable state starts from defaults.
            info!(error = %e, "guardrail state not loaded; starting fresh");
        }
        system
    }

    pub fn limits(&self) -> &GuardrailLimits {
        &self.limits
    }

    // -------------------------------------------------------------------------
    // Pre-trade gate
    // -------------------------------------------------------------------------

    /// Evaluate a proposed trade. `quantity` is signed (positive = buy).
    pub fn check_trade(
        &self,
        symbol: &str,
        quantity: f64,
        estimated_price: f64,
        regime: &str,
    ) -> GuardrailCheck {
        self.maybe_reset_periods();
        self.check_count.fetch_add(1, Ordering::Relaxed);

        let metrics = self.metrics.read().clone();
        let mut violations = Vec::new();
        let mut details = serde_json::Map::new();

        let trade_value = (quantity * estimated_price).abs();
        let signed_value = quantity * estimated_price;

        // 1. Daily drawdown
        let dd = metrics.daily_drawdown();
        details.insert(
            "daily_drawdown".to_string(),
            json!({ "ok": dd <= self.limits.max_dd_day, "current": dd, "max": self.limits.max_dd_day }),
        );
        if dd > self.limits.max_dd_day {
            violations.push(GuardrailViolation::DailyDrawdownExceeded);
        }

        // 2. Weekly drawdown
        let wd = metrics.weekly_drawdown();
        details.insert(
            "weekly_drawdown".to_string(),
            json!({ "ok": wd <= self.limits.max_dd_week, "current": wd, "max": self.limits.max_dd_week }),
        );
        if wd > self.limits.max_dd_week {
            violations.push(GuardrailViolation::WeeklyDrawdownExceeded);
        }

        // 3. Gross exposure after the proposed trade
        let projected_gross = metrics.gross_exposure + trade_value;
        let gross_ratio = projected_gross / metrics.portfolio_value.max(1.0);
        details.insert(
            "exposure".to_string(),
            json!({
                "ok": gross_ratio <= self.limits.max_exposure,
                "projected_gross_exposure": projected_gross,
                "projected_gross_ratio": gross_ratio,
                "projected_net_exposure": metrics.net_exposure + signed_value,
                "max_exposure_ratio": self.limits.max_exposure,
            }),
        );
        if gross_ratio > self.limits.max_exposure {
            violations.push(GuardrailViolation::ExposureLimitExceeded);
        }

        // 4. Single-trade risk
        let risk_ratio = trade_value / metrics.portfolio_value.max(1.0);
        details.insert(
            "single_trade_risk".to_string(),
            json!({ "ok": risk_ratio <= self.limits.max_single_trade_risk, "risk_ratio": risk_ratio }),
        );
        if risk_ratio > self.limits.max_single_trade_risk {
            violations.push(GuardrailViolation::SingleTradeRiskExceeded);
        }

        // 5. Daily trade count
        let trades_ok = metrics.daily_trades < self.limits.max_daily_trades;
        details.insert(
            "daily_trades".to_string(),
            json!({ "ok": trades_ok, "current": metrics.daily_trades, "max": self.limits.max_daily_trades }),
        );
        if !trades_ok {
            violations.push(GuardrailViolation::DailyTradeLimitExceeded);
        }

        // 6. Concurrent orders
        let orders_ok = metrics.concurrent_orders < self.limits.max_concurrent_orders;
        details.insert(
            "concurrent_orders".to_string(),
            json!({ "ok": orders_ok, "current": metrics.concurrent_orders }),
        );
        if !orders_ok {
            violations.push(GuardrailViolation::ConcurrentOrderLimitExceeded);
        }

        // 7. Cash reserve (opening buys only)
        if quantity > 0.0 {
            let min_required = metrics.portfolio_value * self.limits.min_cash_reserve;
            let after_trade = metrics.cash_balance - trade_value;
            let cash_ok = after_trade >= min_required;
            details.insert(
                "cash_reserve".to_string(),
                json!({ "ok": cash_ok, "available_after_trade": after_trade, "min_required": min_required }),
            );
            if !cash_ok {
                violations.push(GuardrailViolation::CashReserveInsufficient);
            }
        }

        // 8. Regime restrictions
        let regime_lower = regime.trim().to_lowercase();
        let kill_switch = self
            .limits
            .regime_kill_switches
            .iter()
            .any(|ks| !ks.trim().is_empty() && regime_lower.contains(&ks.trim().to_lowercase()));
        if kill_switch {
            violations.push(GuardrailViolation::RegimeKillSwitchActive);
        }
        let mut regime_limit_hit = false;
        for (pattern, limit) in &self.limits.regime_exposure_limits {
            if regime_lower.contains(&pattern.to_lowercase())
                && metrics.gross_exposure_ratio() > *limit
            {
                regime_limit_hit = true;
                violations.push(GuardrailViolation::RegimeExposureLimitExceeded);
                break;
            }
        }
        details.insert(
            "regime".to_string(),
            json!({
                "ok": !kill_switch && !regime_limit_hit,
                "regime": regime,
                "kill_switch_active": kill_switch,
                "exposure_limit_exceeded": regime_limit_hit,
            }),
        );

        // 9. Sticky emergency stop
        let stopped = self.emergency_stop.load(Ordering::Relaxed);
        details.insert("emergency_stop".to_string(), json!({ "active": stopped }));
        if stopped && !violations.contains(&GuardrailViolation::RegimeKillSwitchActive) {
            violations.push(GuardrailViolation::RegimeKillSwitchActive);
        }

        let allowed = violations.is_empty();
        if !allowed {
            self.violation_count.fetch_add(1, Ordering::Relaxed);
            warn!(
                symbol,
                quantity,
                estimated_price,
                violations = ?violations.iter().map(|v| v.to_string()).collect::<Vec<_>>(),
                "trade blocked by guardrails"
            );
        }

        GuardrailCheck {
            allowed,
            violations,
            risk_metrics: metrics,
            check_details: Value::Object(details),
            check_timestamp: Utc::now().to_rfc3339(),
        }
    }

    // -------------------------------------------------------------------------
    // Metric updates
    // -------------------------------------------------------------------------

    /// Update any subset of the risk metrics.
    #[allow(clippy::too_many_arguments)]
    pub fn update_metrics(
        &self,
        portfolio_value: Option<f64>,
        cash_balance: Option<f64>,
        gross_exposure: Option<f64>,
        net_exposure: Option<f64>,
        daily_pnl: Option<f64>,
        weekly_pnl: Option<f64>,
        concurrent_orders: Option<u64>,
    ) {
        {
            let mut metrics = self.metrics.write();
            if let Some(v) = portfolio_value {
                metrics.portfolio_value = v;
            }
            if let Some(v) = cash_balance {
                metrics.cash_balance = v;
            }
            if let Some(v) = gross_exposure {
                metrics.gross_exposure = v;
            }
            if let Some(v) = net_exposure {
                metrics.net_exposure = v;
            }
            if let Some(v) = daily_pnl {
                metrics.daily_pnl = v;
            }
            if let Some(v) = weekly_pnl {
                metrics.weekly_pnl = v;
            }
            if let Some(v) = concurrent_orders {
                metrics.concurrent_orders = v;
            }
            metrics.last_updated = Utc::now().to_rfc3339();
        }
        self.save_state();
    }

    /// Count one executed trade against the daily limit.
    pub fn record_trade(&self) {
        self.metrics.write().daily_trades += 1;
        self.save_state();
    }

    pub fn reset_daily_metrics(&self) {
        let mut metrics = self.metrics.write();
        metrics.daily_trades = 0;
        metrics.daily_pnl = 0.0;
        metrics.current_date = Utc::now().format("%Y-%m-%d").to_string();
        drop(metrics);
        info!("daily guardrail metrics reset");
        self.save_state();
    }

    pub fn reset_weekly_metrics(&self) {
        let now = Utc::now();
        let mut metrics = self.metrics.write();
        metrics.weekly_pnl = 0.0;
        metrics.current_week =
            format!("{}-W{:02}", now.iso_week().year(), now.iso_week().week());
        drop(metrics);
        info!("weekly guardrail metrics reset");
        self.save_state();
    }

    /// Block every trade until `deactivate_emergency_stop`.
    pub fn activate_emergency_stop(&self, reason: &str) {
        self.emergency_stop.store(true, Ordering::Relaxed);
        warn!(reason, "EMERGENCY STOP ACTIVATED");
        self.save_state();
    }

    pub fn deactivate_emergency_stop(&self) {
        self.emergency_stop.store(false, Ordering::Relaxed);
        info!("emergency stop deactivated");
        self.save_state();
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stop.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Value {
        let checks = self.check_count.load(Ordering::Relaxed);
        let violations = self.violation_count.load(Ordering::Relaxed);
        json!({
            "check_count": checks,
            "violation_count": violations,
            "violation_rate": violations as f64 / checks.max(1) as f64,
            "persist_failures": self.persist_failures.load(Ordering::Relaxed),
            "emergency_stop": self.emergency_stop.load(Ordering::Relaxed),
            "current_metrics": self.metrics.read().clone(),
            "limits": {
                "max_dd_day": self.limits.max_dd_day,
                "max_dd_week": self.limits.max_dd_week,
                "max_exposure": self.limits.max_exposure,
                "max_single_trade_risk": self.limits.max_single_trade_risk,
                "max_daily_trades": self.limits.max_daily_trades,
                "max_concurrent_orders": self.limits.max_concurrent_orders,
                "min_cash_reserve": self.limits.min_cash_reserve,
            },
        })
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Reset daily/weekly counters when the calendar period rolls over.
    fn maybe_reset_periods(&self) {
        let now = Utc::now();
        let today = now.format("%Y-%m-%d").to_string();
        let week = format!("{}-W{:02}", now.iso_week().year(), now.iso_week().week());

        let (day_rolled, week_rolled) = {
            let metrics = self.metrics.read();
            (
                !metrics.current_date.is_empty() && metrics.current_date != today,
                !metrics.current_week.is_empty() && metrics.current_week != week,
            )
        };
        if day_rolled {
            self.reset_daily_metrics();
        }
        if week_rolled {
            self.reset_weekly_metrics();
        }
    }

    fn save_state(&self) {
        let Some(path) = &self.limits.data_path else {
            return;
        };
        let state = PersistedState {
            metrics: self.metrics.read().clone(),
            violation_count: self.violation_count.load(Ordering::Relaxed),
            check_count: self.check_count.load(Ordering::Relaxed),
            emergency_stop: self.emergency_stop.load(Ordering::Relaxed),
            saved_at: Utc::now().to_rfc3339(),
            version: 1,
        };
        if let Err(e) = atomic_write_json(path, &state) {
            self.persist_failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "failed to persist guardrail state");
        }
    }

    fn load_state(&self) -> Result<()> {
        let Some(path) = &self.limits.data_path else {
            return Ok(());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading guardrail state from {}", path.display()))?;
        let state: PersistedState =
            serde_json::from_str(&content).context("parsing guardrail state")?;

        *self.metrics.write() = state.metrics;
        self.violation_count
            .store(state.violation_count, Ordering::Relaxed);
        self.check_count.store(state.check_count, Ordering::Relaxed);
        self.emergency_stop
            .store(state.emergency_stop, Ordering::Relaxed);
        info!(path = %path.display(), "guardrail state loaded");
        Ok(())
    }
}

/// Write a JSON document atomically: serialize to a tmp sibling, rename.
pub fn atomic_write_json<T: Serialize>(path: &PathBuf, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(value).context("serializing state")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &content)
        .with_context(|| format!("writing tmp file {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming tmp file onto {}", path.display()))?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn system() -> GuardrailSystem {
        GuardrailSystem::new(GuardrailLimits::default())
    }

    #[test]
    fn clean_state_allows_small_trade() {
        let g = system();
        g.update_metrics(
            Some(1_000_000.0),
            Some(500_000.0),
            Some(100_000.0),
            Some(100_000.0),
            None,
            None,
            None,
        );
        let check = g.check_trade("AAPL", 50.0, 100.0, "base");
        assert!(check.allowed, "violations: {:?}", check.violations);
    }

    #[test]
    fn exposure_limit_blocks_projected_breach() {
        // Portfolio 1M, gross 1.49M, trade 200 @ 100 = 20k => ratio 1.51.
        let g = system();
        g.update_metrics(
            Some(1_000_000.0),
            Some(900_000.0),
            Some(1_490_000.0),
            Some(1_490_000.0),
            None,
            None,
            None,
        );
        let check = g.check_trade("X", 200.0, 100.0, "base");
        assert!(!check.allowed);
        assert!(check
            .violations
            .contains(&GuardrailViolation::ExposureLimitExceeded));
        let ratio = check.check_details["exposure"]["projected_gross_ratio"]
            .as_f64()
            .unwrap();
        assert!((ratio - 1.51).abs() < 1e-9);
    }

    #[test]
    fn daily_drawdown_blocks() {
        let g = system();
        g.update_metrics(None, None, None, None, Some(-40_000.0), None, None);
        let check = g.check_trade("AAPL", 10.0, 100.0, "base");
        assert!(check
            .violations
            .contains(&GuardrailViolation::DailyDrawdownExceeded));
    }

    #[test]
    fn weekly_drawdown_blocks() {
        let g = system();
        g.update_metrics(None, None, None, None, None, Some(-70_000.0), None);
        let check = g.check_trade("AAPL", 10.0, 100.0, "base");
        assert!(check
            .violations
            .contains(&GuardrailViolation::WeeklyDrawdownExceeded));
    }

    #[test]
    fn single_trade_risk_blocks_oversized_trade() {
        let g = system();
        // 1% of 1M = 10k; 200 * 100 = 20k.
        let check = g.check_trade("AAPL", 200.0, 100.0, "base");
        assert!(check
            .violations
            .contains(&GuardrailViolation::SingleTradeRiskExceeded));
    }

    #[test]
    fn daily_trade_limit_blocks() {
        let g = system();
        for _ in 0..100 {
            g.record_trade();
        }
        let check = g.check_trade("AAPL", 10.0, 100.0, "base");
        assert!(check
            .violations
            .contains(&GuardrailViolation::DailyTradeLimitExceeded));
    }

    #[test]
    fn concurrent_order_limit_blocks() {
        let g = system();
        g.update_metrics(None, None, None, None, None, None, Some(50));
        let check = g.check_trade("AAPL", 10.0, 100.0, "base");
        assert!(check
            .violations
            .contains(&GuardrailViolation::ConcurrentOrderLimitExceeded));
    }

    #[test]
    fn cash_reserve_blocks_buy_but_not_sell() {
        let g = system();
        g.update_metrics(None, Some(55_000.0), None, None, None, None, None);
        // Buy of 9k leaves 46k < 50k reserve.
        let buy = g.check_trade("AAPL", 90.0, 100.0, "base");
        assert!(buy
            .violations
            .contains(&GuardrailViolation::CashReserveInsufficient));
        // A sell never consumes cash.
        let sell = g.check_trade("AAPL", -90.0, 100.0, "base");
        assert!(!sell
            .violations
            .contains(&GuardrailViolation::CashReserveInsufficient));
    }

    #[test]
    fn regime_kill_switch_blocks() {
        let g = system();
        let check = g.check_trade("AAPL", 10.0, 100.0, "crash_mode");
        assert!(check
            .violations
            .contains(&GuardrailViolation::RegimeKillSwitchActive));
    }

    #[test]
    fn regime_exposure_limit_blocks_in_high_vol() {
        let g = system();
        g.update_metrics(None, None, Some(800_000.0), None, None, None, None);
        // vol_hi caps gross ratio at 0.75; current is 0.8.
        let check = g.check_trade("AAPL", 10.0, 100.0, "vol_hi");
        assert!(check
            .violations
            .contains(&GuardrailViolation::RegimeExposureLimitExceeded));
    }

    #[test]
    fn emergency_stop_is_sticky_until_resume() {
        let g = system();
        g.activate_emergency_stop("test");

        for _ in 0..3 {
            let check = g.check_trade("AAPL", 1.0, 100.0, "base");
            assert!(!check.allowed);
            assert!(check
                .violations
                .contains(&GuardrailViolation::RegimeKillSwitchActive));
        }

        g.deactivate_emergency_stop();
        let check = g.check_trade("AAPL", 1.0, 100.0, "base");
        assert!(check.allowed);
    }

    #[test]
    fn stats_track_check_and_violation_counts() {
        let g = system();
        g.check_trade("AAPL", 1.0, 100.0, "base");
        g.check_trade("AAPL", 10_000.0, 100.0, "base"); // blocked
        let stats = g.stats();
        assert_eq!(stats["check_count"], 2);
        assert_eq!(stats["violation_count"], 1);
    }

    #[test]
    fn state_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guardrails.json");

        let limits = GuardrailLimits {
            data_path: Some(path.clone()),
            ..GuardrailLimits::default()
        };
        let g = GuardrailSystem::new(limits.clone());
        g.activate_emergency_stop("persist test");
        g.record_trade();
        g.record_trade();

        let restored = GuardrailSystem::new(limits);
        assert!(restored.is_emergency_stopped());
        assert_eq!(restored.metrics.read().daily_trades, 2);
        // Atomic write leaves no tmp file behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn reset_daily_clears_counters() {
        let g = system();
        g.record_trade();
        g.update_metrics(None, None, None, None, Some(-500.0), None, None);
        g.reset_daily_metrics();
        let metrics = g.metrics.read();
        assert_eq!(metrics.daily_trades, 0);
        assert_eq!(metrics.daily_pnl, 0.0);
    }
}
