// =============================================================================
// Paper worker -- the orchestration loop
// =============================================================================
//
// Each market cycle: synthesize bars, compute features, run the enabled
// theories, gate their signals through the bandit allocation and the
// guardrails, and hand survivors to the engine. A slower cycle drains
// executed trades, records execution quality, waits for labels to mature,
// then feeds outcomes to the allocator and the learner. A nightly task
// runs the calibration report and pushes suggested weights back into the
// allocator.
//
// Broadcasts honor the hub's backpressure contract: a producer that sees
// queue utilization at or above the threshold skips that tick.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::allocator::AllocationResult;
use crate::app_state::AppState;
use crate::engine::ExecutedTrade;
use crate::features::{FeatureSet, VolRegime};
use crate::learn_report::{LabeledEvent, NightlyLearnJob};
use crate::types::Signal;

/// How long past the first horizon a trade waits before labeling.
const LABEL_GRACE_MINS: i64 = 1;
/// Pending trades older than this are abandoned unlabeled.
const LABEL_ABANDON_MINS: i64 = 120;
/// Interval of the label/learning cycle.
const LABEL_CYCLE_SECS: u64 = 15;
/// Interval of the nightly report job.
const NIGHTLY_INTERVAL_SECS: u64 = 24 * 60 * 60;

struct PendingTrade {
    execution: ExecutedTrade,
    ready_at: chrono::DateTime<Utc>,
}

/// Coordinates the full pipeline across the shared components.
pub struct PaperWorker {
    state: Arc<AppState>,
    rng: Mutex<ChaCha8Rng>,
    pending: Mutex<Vec<PendingTrade>>,
    pub signals_generated: AtomicU64,
    pub signals_gated_out: AtomicU64,
    pub trades_blocked: AtomicU64,
    pub labels_produced: AtomicU64,
}

impl PaperWorker {
    pub fn new(state: Arc<AppState>) -> Arc<Self> {
        let seed = state.config.read().feed_seed;
        Arc::new(Self {
            state,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed.wrapping_add(1))),
            pending: Mutex::new(Vec::new()),
            signals_generated: AtomicU64::new(0),
            signals_gated_out: AtomicU64::new(0),
            trades_blocked: AtomicU64::new(0),
            labels_produced: AtomicU64::new(0),
        })
    }

    /// Spawn the three worker loops.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let market = {
            let worker = self.clone();
            tokio::spawn(async move {
                let interval = worker.state.config.read().cycle_interval_secs;
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(interval.max(1)));
                info!(interval_secs = interval, "market cycle started");
                loop {
                    ticker.tick().await;
                    worker.run_market_cycle().await;
                }
            })
        };

        let labeling = {
            let worker = self.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(LABEL_CYCLE_SECS));
                info!("label cycle started");
                loop {
                    ticker.tick().await;
                    worker.run_label_cycle().await;
                }
            })
        };

        let nightly = {
            let worker = self.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(NIGHTLY_INTERVAL_SECS));
                // The first tick of a tokio interval fires immediately;
                // consume it so the job runs after a full period.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    worker.run_nightly_job();
                }
            })
        };

        vec![market, labeling, nightly]
    }

    // -------------------------------------------------------------------------
    // Market cycle
    // -------------------------------------------------------------------------

    pub async fn run_market_cycle(&self) {
        let state = &self.state;

        // 1. New bars into the window, label history, and quality monitor.
        let bars = state.feed.tick(&state.window);
        for bar in &bars {
            state.labels.add_bar(bar.clone());
            state
                .quality
                .record_market_data(&bar.symbol, bar.close, bar.volume, bar.timestamp);
        }

        // Market-data fan-out, skipped under backpressure.
        if !state.hub.should_backpressure("market_data") {
            for bar in &bars {
                let payload = json!({
                    "type": "market_data",
                    "symbol": bar.symbol,
                    "close": bar.close,
                    "volume": bar.volume,
                    "ts": bar.timestamp.to_rfc3339(),
                });
                state.hub.broadcast_to_type(payload.clone(), "market_data").await;
                let symbol_channel = format!("market_data:{}", bar.symbol);
                if !state.hub.should_backpressure(&symbol_channel) {
                    state.hub.broadcast_to_type(payload, &symbol_channel).await;
                }
            }
        }

        // 2. Features and signals per symbol.
        let symbols = state.config.read().symbols.clone();
        let mut signals: Vec<Signal> = Vec::new();
        for symbol in &symbols {
            if let Some(features) = state.features.compute_features(symbol) {
                signals.extend(state.registry.generate_signals(&features));
            }
        }
        self.signals_generated
            .fetch_add(signals.len() as u64, Ordering::Relaxed);

        // 3. Bandit allocation over the enabled theories.
        let enabled = state.registry.enabled_ids();
        let allocation = state.allocator.allocate(&enabled);
        for (theory_id, weight) in &allocation.allocations {
            state.engine.record_allocation_weight(theory_id, *weight);
        }

        // 4. Gate, guard, submit.
        for signal in signals {
            if !self.gate_signal(&signal, &allocation) {
                self.signals_gated_out.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if !self.passes_guardrails(&signal) {
                self.trades_blocked.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let accepted = state.engine.submit_signal(signal.clone());
            if accepted && !state.hub.should_backpressure("trading_signals") {
                state
                    .hub
                    .broadcast_to_type(
                        json!({
                            "type": "trading_signal",
                            "signal_id": signal.signal_id,
                            "theory_id": signal.theory_id,
                            "symbol": signal.symbol,
                            "side": signal.side,
                            "confidence": signal.confidence,
                            "horizon_mins": signal.horizon_mins,
                            "ts": signal.timestamp.to_rfc3339(),
                        }),
                        "trading_signals",
                    )
                    .await;
            }
        }

        // 5. Portfolio fan-out.
        if !state.hub.should_backpressure("portfolio") {
            let summary = state.broker.performance_summary();
            state
                .hub
                .broadcast_to_type(
                    json!({
                        "type": "portfolio",
                        "net_pnl": summary.net_pnl,
                        "realized_pnl": summary.realized_pnl,
                        "unrealized_pnl": summary.unrealized_pnl,
                        "num_positions": summary.num_positions,
                        "total_fees": summary.total_fees,
                        "ts": Utc::now().to_rfc3339(),
                    }),
                    "portfolio",
                )
                .await;
        }

        state.increment_version();
    }

    /// Allocation gate: the selected theory always passes; others pass with
    /// probability equal to their allocation weight scaled by the theory's
    /// own risk multiplier.
    fn gate_signal(&self, signal: &Signal, allocation: &AllocationResult) -> bool {
        let weight = allocation
            .allocations
            .get(&signal.theory_id)
            .copied()
            .unwrap_or(0.0);
        if weight <= 0.0 {
            return false;
        }

        let multiplier = self
            .state
            .registry
            .risk_multiplier(&signal.theory_id, &signal.features);
        if multiplier <= 0.0 {
            return false;
        }

        if signal.theory_id == allocation.selected_theory {
            return true;
        }
        let roll: f64 = self.rng.lock().gen();
        roll < weight * multiplier
    }

    fn passes_guardrails(&self, signal: &Signal) -> bool {
        let state = &self.state;
        let price = state.broker.reference_price(&signal.symbol);
        if price <= 0.0 {
            return false;
        }
        let micro = state.config.read().microtrade_notional;
        let est_qty = (micro / price).max(1.0) * signal.side.sign();

        let check = state.guardrails.check_trade(
            &signal.symbol,
            est_qty,
            price,
            &regime_tag(&signal.features),
        );
        if !check.allowed {
            debug!(
                symbol = %signal.symbol,
                theory = %signal.theory_id,
                violations = ?check.violations,
                "signal blocked by guardrails"
            );
        }
        check.allowed
    }

    // -------------------------------------------------------------------------
    // Label / learning cycle
    // -------------------------------------------------------------------------

    pub async fn run_label_cycle(&self) {
        self.collect_executions();
        self.label_ready_trades();
        self.sync_guardrail_metrics();
    }

    /// Pull newly executed trades from the engine: record quality and the
    /// daily trade count, then queue them for labeling once their first
    /// horizon has elapsed.
    fn collect_executions(&self) {
        let state = &self.state;
        let executions = state.engine.drain_executions();
        if executions.is_empty() {
            return;
        }

        let mut pending = self.pending.lock();
        for execution in executions {
            state.guardrails.record_trade();
            state.quality.record_execution(
                &execution.fill.order_id.to_string(),
                &execution.fill.symbol,
                execution.fill.side,
                execution.fill.qty as f64,
                execution.fill.avg_price,
                "paper",
                execution.signal.timestamp,
                execution.fill.timestamp,
                execution.fill.fees,
            );

            let first_horizon = execution.signal.horizon_mins.min(5);
            let ready_at = execution.fill.timestamp
                + ChronoDuration::minutes(first_horizon + LABEL_GRACE_MINS);
            pending.push(PendingTrade {
                execution,
                ready_at,
            });
        }
        debug!(pending = pending.len(), "executions queued for labeling");
    }

    /// Label trades whose horizon has matured; feed outcomes to the
    /// allocator, the learner, and the event log.
    fn label_ready_trades(&self) {
        let state = &self.state;
        let now = Utc::now();

        let ready: Vec<PendingTrade> = {
            let mut pending = self.pending.lock();
            let mut ready = Vec::new();
            let mut keep = Vec::new();
            for item in pending.drain(..) {
                if now >= item.ready_at {
                    ready.push(item);
                } else {
                    keep.push(item);
                }
            }
            *pending = keep;
            ready
        };

        for item in ready {
            let fill = &item.execution.fill;
            let signal = &item.execution.signal;

            let label =
                state
                    .labels
                    .generate(&fill.symbol, fill.timestamp, fill.avg_price, fill.side);
            let Some(horizon) = label.horizons.first().copied() else {
                // No future bars yet: requeue unless hopeless.
                let age_mins = (now - fill.timestamp).num_minutes();
                if age_mins < LABEL_ABANDON_MINS {
                    self.pending.lock().push(PendingTrade {
                        ready_at: now + ChronoDuration::minutes(LABEL_GRACE_MINS),
                        execution: item.execution,
                    });
                } else {
                    warn!(symbol = %fill.symbol, age_mins, "abandoning unlabeled trade");
                }
                continue;
            };

            let pnl_bps = horizon.forward_return * 10_000.0;
            let notional = fill.avg_price * fill.qty as f64;
            let fees_bps = if notional > 0.0 {
                fill.fees / notional * 10_000.0
            } else {
                0.0
            };
            state.allocator.update_performance(
                &signal.theory_id,
                pnl_bps,
                fees_bps,
                horizon.forward_return > 0.0,
                fill.timestamp,
            );

            // Learner update plus the calibration event.
            let features = signal.features.learning_vector();
            let target = if horizon.forward_return > 0.0 { 1.0 } else { 0.0 };
            let (p_up, explain) = {
                let mut learner = state.learner.lock();
                let p_up = learner.predict_p_up(&[features.clone()])[0];
                learner.partial_fit(&[features.clone()], &[target], None);
                let explain = learner
                    .explain(&features)
                    .map(|e| {
                        crate::features::LEARNING_FEATURE_NAMES
                            .iter()
                            .zip(e.feature_importance.iter())
                            .map(|(name, weight)| (name.to_string(), *weight))
                            .collect()
                    })
                    .unwrap_or_default();
                (p_up, explain)
            };

            state.event_log.append(LabeledEvent {
                ts: now,
                symbol: fill.symbol.clone(),
                theory_id: signal.theory_id.clone(),
                p_up: Some(p_up),
                label: Some(if target > 0.5 { 1 } else { 0 }),
                explain,
            });
            self.labels_produced.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Mirror engine exposure and broker PnL into the guardrail metrics.
    fn sync_guardrail_metrics(&self) {
        let state = &self.state;
        let exposure = state.engine.exposure();
        let gross: f64 = exposure.values().map(|v| v.abs()).sum();
        let net: f64 = exposure.values().sum();
        let summary = state.broker.performance_summary();
        state.guardrails.update_metrics(
            None,
            None,
            Some(gross),
            Some(net),
            Some(summary.net_pnl),
            None,
            Some(state.engine.get_status().stats.open_trades as u64),
        );
    }

    // -------------------------------------------------------------------------
    // Nightly job
    // -------------------------------------------------------------------------

    pub fn run_nightly_job(&self) {
        let state = &self.state;
        let (report_path, drift_threshold) = {
            let config = state.config.read();
            (config.learn_report_path.clone(), config.drift_threshold)
        };
        let job = NightlyLearnJob::new(report_path, drift_threshold);
        match job.run(&state.event_log.snapshot()) {
            Ok(report) => {
                state
                    .allocator
                    .apply_weight_suggestions(&report.suggested_weights);
            }
            Err(e) => warn!(error = %e, "nightly learning job failed"),
        }
    }
}

/// Regime tag handed to the guardrails, derived from the volatility regime.
fn regime_tag(features: &FeatureSet) -> String {
    match features.vol_regime {
        VolRegime::High => "vol_hi".to_string(),
        VolRegime::Low => "vol_lo".to_string(),
        VolRegime::Normal => "base".to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Fill;
    use crate::config::LabConfig;
    use crate::market_data::PriceBar;
    use crate::types::Side;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn test_state() -> Arc<AppState> {
        let mut config = LabConfig::default();
        config.symbols = vec!["AAPL".to_string()];
        // Keep persistence out of unit tests.
        config.guardrails.data_path = std::env::temp_dir()
            .join(format!("meridian-test-guardrails-{}.json", Uuid::new_v4()));
        config.quality_data_path = std::env::temp_dir()
            .join(format!("meridian-test-quality-{}.json", Uuid::new_v4()));
        AppState::new(config)
    }

    fn allocation_for(theory: &str, weight: f64, selected: &str) -> AllocationResult {
        let mut allocations = HashMap::new();
        allocations.insert(theory.to_string(), weight);
        AllocationResult {
            allocations,
            selected_theory: selected.to_string(),
            confidence: 0.5,
            algorithm_state: serde_json::json!({}),
        }
    }

    fn executed_trade(state: &Arc<AppState>, minutes_ago: i64) -> ExecutedTrade {
        let fill_time = Utc::now() - ChronoDuration::minutes(minutes_ago);
        ExecutedTrade {
            signal: Signal::new(
                "mean_revert",
                "AAPL",
                Side::Buy,
                0.8,
                5,
                FeatureSet {
                    symbol: "AAPL".to_string(),
                    price: 100.0,
                    ..FeatureSet::default()
                },
            ),
            fill: Fill {
                order_id: Uuid::new_v4(),
                client_order_id: Uuid::new_v4(),
                symbol: "AAPL".to_string(),
                side: Side::Buy,
                qty: 1,
                avg_price: 100.0,
                fees: 0.01,
                slippage_bps: 0.0,
                timestamp: fill_time,
            },
        }
    }

    fn push_label_bars(state: &Arc<AppState>, start_minutes_ago: i64, closes: &[f64]) {
        let start = Utc::now() - ChronoDuration::minutes(start_minutes_ago);
        for (i, &close) in closes.iter().enumerate() {
            state.labels.add_bar(PriceBar {
                symbol: "AAPL".to_string(),
                timestamp: start + ChronoDuration::minutes(i as i64),
                open: close,
                high: close + 0.2,
                low: close - 0.2,
                close,
                volume: 1_000.0,
            });
        }
    }

    #[test]
    fn regime_tag_maps_vol_regimes() {
        let mut features = FeatureSet::default();
        assert_eq!(regime_tag(&features), "base");
        features.vol_regime = VolRegime::High;
        assert_eq!(regime_tag(&features), "vol_hi");
        features.vol_regime = VolRegime::Low;
        assert_eq!(regime_tag(&features), "vol_lo");
    }

    #[test]
    fn selected_theory_always_passes_gate() {
        let state = test_state();
        let worker = PaperWorker::new(state);
        let signal = Signal::new(
            "mean_revert",
            "AAPL",
            Side::Buy,
            0.9,
            5,
            FeatureSet::default(),
        );
        let allocation = allocation_for("mean_revert", 0.9, "mean_revert");
        for _ in 0..20 {
            assert!(worker.gate_signal(&signal, &allocation));
        }
    }

    #[test]
    fn zero_weight_never_passes_gate() {
        let state = test_state();
        let worker = PaperWorker::new(state);
        let signal = Signal::new(
            "mean_revert",
            "AAPL",
            Side::Buy,
            0.9,
            5,
            FeatureSet::default(),
        );
        let allocation = allocation_for("breakout", 1.0, "breakout");
        for _ in 0..20 {
            assert!(!worker.gate_signal(&signal, &allocation));
        }
    }

    #[test]
    fn emergency_stop_blocks_signals() {
        let state = test_state();
        let worker = PaperWorker::new(state.clone());
        state.guardrails.activate_emergency_stop("test");

        let signal = Signal::new(
            "mean_revert",
            "AAPL",
            Side::Buy,
            0.9,
            5,
            FeatureSet::default(),
        );
        assert!(!worker.passes_guardrails(&signal));

        state.guardrails.deactivate_emergency_stop();
        assert!(worker.passes_guardrails(&signal));
    }

    #[tokio::test]
    async fn matured_trade_is_labeled_and_learned() {
        let state = test_state();
        let worker = PaperWorker::new(state.clone());

        // Trade filled 10 minutes ago; price then rose ~1%.
        push_label_bars(
            &state,
            10,
            &[100.0, 100.2, 100.4, 100.6, 100.8, 101.0, 101.0, 101.0],
        );
        worker.pending.lock().push(PendingTrade {
            execution: executed_trade(&state, 10),
            ready_at: Utc::now() - ChronoDuration::minutes(1),
        });

        worker.label_ready_trades();

        assert_eq!(worker.labels_produced.load(Ordering::Relaxed), 1);
        assert_eq!(state.event_log.len(), 1);
        let event = &state.event_log.snapshot()[0];
        assert_eq!(event.label, Some(1));
        assert!(event.p_up.is_some());

        let arms = state.allocator.get_state().arms;
        assert_eq!(arms["mean_revert"].total_trades, 1);
        assert_eq!(arms["mean_revert"].winning_trades, 1);
        assert!(state.learner.lock().is_fitted());
    }

    #[tokio::test]
    async fn unlabelable_trade_is_requeued() {
        let state = test_state();
        let worker = PaperWorker::new(state.clone());

        // No label bars at all: the generate call yields no horizons.
        worker.pending.lock().push(PendingTrade {
            execution: executed_trade(&state, 10),
            ready_at: Utc::now() - ChronoDuration::minutes(1),
        });
        worker.label_ready_trades();

        assert_eq!(worker.labels_produced.load(Ordering::Relaxed), 0);
        assert_eq!(worker.pending.lock().len(), 1);
    }

    #[tokio::test]
    async fn collect_executions_records_quality_and_trade_count() {
        let state = test_state();
        let worker = PaperWorker::new(state.clone());

        // Engine holds one drained execution.
        state
            .engine
            .start(crate::engine::RunParams {
                universe: vec!["AAPL".to_string()],
                theories: vec!["mean_revert".to_string()],
                ..crate::engine::RunParams::default()
            })
            .await
            .unwrap();
        state.engine.submit_signal(Signal::new(
            "mean_revert",
            "AAPL",
            Side::Buy,
            0.9,
            5,
            FeatureSet::default(),
        ));
        tokio::time::sleep(Duration::from_millis(300)).await;

        worker.collect_executions();
        assert_eq!(worker.pending.lock().len(), 1);
        assert_eq!(state.quality.execution_count(), 1);
        state.engine.stop().await;
    }

    #[tokio::test]
    async fn market_cycle_runs_end_to_end() {
        let state = test_state();
        state.feed.backfill(&state.window, 60);
        state
            .engine
            .start(state.config.read().run_params())
            .await
            .unwrap();

        let worker = PaperWorker::new(state.clone());
        for _ in 0..5 {
            worker.run_market_cycle().await;
        }

        // The cycle must always advance the version and compute allocations.
        assert!(state.current_version() >= 5);
        let status = state.engine.get_status();
        let weight_sum: f64 = status
            .theory_stats
            .values()
            .map(|t| t.allocation_weight)
            .sum();
        assert!(weight_sum > 0.99, "allocation weights not recorded");

        state.engine.stop().await;
        state.hub.stop();
    }
}
