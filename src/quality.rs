// =============================================================================
// Execution quality -- slippage vs mid/VWAP, market impact, venue buckets
// =============================================================================
//
// Every fill is compared against (a) the mid at submit, (b) the mid at
// fill, and (c) the VWAP over a trailing window. Results aggregate into
// 15-minute buckets keyed by (venue, symbol). History is bounded and old
// buckets are pruned past the retention window; state persists atomically.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, Duration, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::guardrails::atomic_write_json;
use crate::types::Side;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One market-data observation used for mid and VWAP computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataPoint {
    pub price: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

/// One execution with its computed quality metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub fill_price: f64,
    pub fill_time: DateTime<Utc>,
    pub venue: String,
    pub submit_time: DateTime<Utc>,

    pub mid_at_submit: Option<f64>,
    pub mid_at_fill: Option<f64>,
    pub vwap_window: Option<f64>,

    pub slippage_vs_mid_submit_bps: Option<f64>,
    pub slippage_vs_mid_fill_bps: Option<f64>,
    pub slippage_vs_vwap_bps: Option<f64>,
    /// Signed change in mid from submit to fill, from the trade's view.
    pub market_impact_bps: Option<f64>,

    pub time_to_fill_ms: i64,
    pub commission: f64,
}

/// Aggregated quality statistics for one (venue, symbol, bucket).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityBucket {
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub venue: String,
    pub symbol: String,
    pub execution_count: u64,
    pub total_volume: f64,
    pub avg_slippage_vs_mid_bps: f64,
    pub avg_slippage_vs_vwap_bps: f64,
    pub avg_market_impact_bps: f64,
}

/// Slippage of a fill against a reference price, in basis points. Positive
/// means the fill was worse than the reference for that side.
pub fn slippage_bps(fill_price: f64, reference: f64, side: Side) -> f64 {
    if reference == 0.0 {
        return 0.0;
    }
    match side {
        Side::Buy => 10_000.0 * (fill_price - reference) / reference,
        Side::Sell => 10_000.0 * (reference - fill_price) / reference,
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    pub vwap_window_secs: i64,
    pub bucket_mins: u32,
    pub retention_days: i64,
    /// Bounded execution history.
    pub max_executions: usize,
    pub data_path: Option<PathBuf>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            vwap_window_secs: 300,
            bucket_mins: 15,
            retention_days: 30,
            max_executions: 1_000,
            data_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

const MARKET_DATA_CAP: usize = 1_000;

#[derive(Serialize, Deserialize)]
struct PersistedQuality {
    executions: Vec<ExecutionRecord>,
    buckets: Vec<QualityBucket>,
    saved_at: String,
    version: u32,
}

struct Inner {
    executions: Vec<ExecutionRecord>,
    market_data: HashMap<String, VecDeque<MarketDataPoint>>,
    buckets: HashMap<(String, String, DateTime<Utc>), QualityBucket>,
}

/// Execution quality monitor.
pub struct QualityMonitor {
    inner: Mutex<Inner>,
    config: QualityConfig,
}

impl QualityMonitor {
    pub fn new(config: QualityConfig) -> Self {
        let monitor = Self {
            inner: Mutex::new(Inner {
                executions: Vec::new(),
                market_data: HashMap::new(),
                buckets: HashMap::new(),
            }),
            config,
        };
        monitor.load_state();
        monitor
    }

    /// Record a market-data point for mid / VWAP computation.
    pub fn record_market_data(
        &self,
        symbol: &str,
        price: f64,
        volume: f64,
        timestamp: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock();
        let ring = inner
            .market_data
            .entry(symbol.to_string())
            .or_insert_with(|| VecDeque::with_capacity(MARKET_DATA_CAP));
        ring.push_back(MarketDataPoint {
            price,
            volume,
            timestamp,
        });
        while ring.len() > MARKET_DATA_CAP {
            ring.pop_front();
        }
    }

    /// Record an execution, compute its quality metrics, and fold it into
    /// the (venue, symbol) bucket.
    #[allow(clippy::too_many_arguments)]
    pub fn record_execution(
        &self,
        execution_id: &str,
        symbol: &str,
        side: Side,
        quantity: f64,
        fill_price: f64,
        venue: &str,
        submit_time: DateTime<Utc>,
        fill_time: DateTime<Utc>,
        commission: f64,
    ) -> ExecutionRecord {
        let mut inner = self.inner.lock();

        // Market context from the symbol's data ring.
        let (mid_at_submit, mid_at_fill, vwap) = {
            let points = inner.market_data.get(symbol);
            match points {
                Some(points) if !points.is_empty() => {
                    let mid_at_fill = points.back().map(|p| p.price);
                    let mid_at_submit = closest_point(points, submit_time).map(|p| p.price);
                    let vwap = vwap_over_window(points, fill_time, self.config.vwap_window_secs);
                    (mid_at_submit, mid_at_fill, vwap)
                }
                _ => {
                    debug!(symbol, "no market data for execution context");
                    (None, None, None)
                }
            }
        };

        let mut record = ExecutionRecord {
            execution_id: execution_id.to_string(),
            symbol: symbol.to_string(),
            side,
            quantity,
            fill_price,
            fill_time,
            venue: venue.to_string(),
            submit_time,
            mid_at_submit,
            mid_at_fill,
            vwap_window: vwap,
            slippage_vs_mid_submit_bps: None,
            slippage_vs_mid_fill_bps: None,
            slippage_vs_vwap_bps: None,
            market_impact_bps: None,
            time_to_fill_ms: (fill_time - submit_time).num_milliseconds(),
            commission,
        };

        record.slippage_vs_mid_submit_bps =
            mid_at_submit.map(|mid| slippage_bps(fill_price, mid, side));
        record.slippage_vs_mid_fill_bps =
            mid_at_fill.map(|mid| slippage_bps(fill_price, mid, side));
        record.slippage_vs_vwap_bps = vwap.map(|v| slippage_bps(fill_price, v, side));
        if let (Some(at_submit), Some(at_fill)) = (mid_at_submit, mid_at_fill) {
            if at_submit != 0.0 {
                let signed = match side {
                    Side::Buy => at_fill - at_submit,
                    Side::Sell => at_submit - at_fill,
                };
                record.market_impact_bps = Some(10_000.0 * signed / at_submit);
            }
        }

        self.update_bucket(&mut inner, &record);

        inner.executions.push(record.clone());
        if inner.executions.len() > self.config.max_executions {
            let excess = inner.executions.len() - self.config.max_executions;
            inner.executions.drain(..excess);
        }
        self.prune_old_buckets(&mut inner);
        drop(inner);

        info!(
            execution_id,
            symbol,
            side = %side,
            quantity,
            fill_price,
            venue,
            "execution recorded"
        );
        self.save_state();
        record
    }

    /// Bucketed stats, optionally filtered by venue and symbol, for the
    /// trailing `hours`.
    pub fn report(
        &self,
        venue: Option<&str>,
        symbol: Option<&str>,
        hours: i64,
    ) -> Vec<QualityBucket> {
        let cutoff = Utc::now() - Duration::hours(hours);
        let inner = self.inner.lock();
        let mut buckets: Vec<QualityBucket> = inner
            .buckets
            .values()
            .filter(|b| b.bucket_start >= cutoff)
            .filter(|b| venue.map_or(true, |v| b.venue == v))
            .filter(|b| symbol.map_or(true, |s| b.symbol == s))
            .cloned()
            .collect();
        buckets.sort_by_key(|b| b.bucket_start);
        buckets
    }

    /// Average slippage and volume per venue over the trailing `hours`.
    pub fn venue_comparison(&self, hours: i64) -> Value {
        let buckets = self.report(None, None, hours);
        let mut per_venue: HashMap<String, (f64, f64, u64)> = HashMap::new();
        for bucket in buckets {
            let entry = per_venue.entry(bucket.venue.clone()).or_insert((0.0, 0.0, 0));
            entry.0 += bucket.avg_slippage_vs_mid_bps * bucket.execution_count as f64;
            entry.1 += bucket.total_volume;
            entry.2 += bucket.execution_count;
        }
        let comparison: serde_json::Map<String, Value> = per_venue
            .into_iter()
            .map(|(venue, (weighted_slip, volume, count))| {
                (
                    venue,
                    json!({
                        "avg_slippage_vs_mid_bps": if count > 0 { weighted_slip / count as f64 } else { 0.0 },
                        "total_volume": volume,
                        "execution_count": count,
                    }),
                )
            })
            .collect();
        Value::Object(comparison)
    }

    /// Look up one execution by id.
    pub fn get_execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.inner
            .lock()
            .executions
            .iter()
            .find(|e| e.execution_id == execution_id)
            .cloned()
    }

    pub fn execution_count(&self) -> usize {
        self.inner.lock().executions.len()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn update_bucket(&self, inner: &mut Inner, record: &ExecutionRecord) {
        let bucket_start = bucket_floor(record.fill_time, self.config.bucket_mins);
        let key = (
            record.venue.clone(),
            record.symbol.clone(),
            bucket_start,
        );
        let bucket = inner.buckets.entry(key).or_insert_with(|| QualityBucket {
            bucket_start,
            bucket_end: bucket_start + Duration::minutes(self.config.bucket_mins as i64),
            venue: record.venue.clone(),
            symbol: record.symbol.clone(),
            execution_count: 0,
            total_volume: 0.0,
            avg_slippage_vs_mid_bps: 0.0,
            avg_slippage_vs_vwap_bps: 0.0,
            avg_market_impact_bps: 0.0,
        });

        let old = bucket.execution_count as f64;
        let new = old + 1.0;
        bucket.execution_count += 1;
        bucket.total_volume += record.quantity.abs();

        if let Some(slip) = record.slippage_vs_mid_submit_bps {
            bucket.avg_slippage_vs_mid_bps =
                (bucket.avg_slippage_vs_mid_bps * old + slip) / new;
        }
        if let Some(slip) = record.slippage_vs_vwap_bps {
            bucket.avg_slippage_vs_vwap_bps =
                (bucket.avg_slippage_vs_vwap_bps * old + slip) / new;
        }
        if let Some(impact) = record.market_impact_bps {
            bucket.avg_market_impact_bps =
                (bucket.avg_market_impact_bps * old + impact) / new;
        }
    }

    fn prune_old_buckets(&self, inner: &mut Inner) {
        let cutoff = Utc::now() - Duration::days(self.config.retention_days);
        inner.buckets.retain(|_, b| b.bucket_start >= cutoff);
    }

    fn save_state(&self) {
        let Some(path) = &self.config.data_path else {
            return;
        };
        let inner = self.inner.lock();
        let state = PersistedQuality {
            executions: inner.executions.clone(),
            buckets: inner.buckets.values().cloned().collect(),
            saved_at: Utc::now().to_rfc3339(),
            version: 1,
        };
        drop(inner);
        if let Err(e) = atomic_write_json(path, &state) {
            warn!(error = %e, "failed to persist quality state");
        }
    }

    fn load_state(&self) {
        let Some(path) = &self.config.data_path else {
            return;
        };
        let Ok(content) = std::fs::read_to_string(path) else {
            return;
        };
        match serde_json::from_str::<PersistedQuality>(&content) {
            Ok(state) => {
                let mut inner = self.inner.lock();
                inner.executions = state.executions;
                inner.buckets = state
                    .buckets
                    .into_iter()
                    .map(|b| ((b.venue.clone(), b.symbol.clone(), b.bucket_start), b))
                    .collect();
                info!(path = %path.display(), "quality state loaded");
            }
            Err(e) => warn!(error = %e, "quality state unreadable; starting fresh"),
        }
    }
}

/// Floor a timestamp to its bucket start.
fn bucket_floor(ts: DateTime<Utc>, bucket_mins: u32) -> DateTime<Utc> {
    let minute = (ts.minute() / bucket_mins) * bucket_mins;
    ts.with_minute(minute)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Market-data point closest in time to `target`.
fn closest_point(
    points: &VecDeque<MarketDataPoint>,
    target: DateTime<Utc>,
) -> Option<&MarketDataPoint> {
    points.iter().min_by_key(|p| (p.timestamp - target).num_milliseconds().abs())
}

/// Volume-weighted average price over the trailing window ending at
/// `reference_time`. `None` when no volume traded in the window.
fn vwap_over_window(
    points: &VecDeque<MarketDataPoint>,
    reference_time: DateTime<Utc>,
    window_secs: i64,
) -> Option<f64> {
    let start = reference_time - Duration::seconds(window_secs);
    let mut total_value = 0.0;
    let mut total_volume = 0.0;
    for point in points {
        if point.timestamp >= start && point.timestamp <= reference_time {
            total_value += point.price * point.volume;
            total_volume += point.volume;
        }
    }
    (total_volume > 0.0).then(|| total_value / total_volume)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 14, 7, 0).unwrap()
    }

    fn monitor() -> QualityMonitor {
        QualityMonitor::new(QualityConfig::default())
    }

    #[test]
    fn slippage_sign_convention() {
        // Buying above the reference is adverse (positive bps).
        assert!((slippage_bps(100.1, 100.0, Side::Buy) - 10.0).abs() < 1e-9);
        assert!((slippage_bps(99.9, 100.0, Side::Buy) + 10.0).abs() < 1e-9);
        // Selling below the reference is adverse.
        assert!((slippage_bps(99.9, 100.0, Side::Sell) - 10.0).abs() < 1e-9);
        assert_eq!(slippage_bps(100.0, 0.0, Side::Buy), 0.0);
    }

    #[test]
    fn bucket_floor_rounds_down_to_quarter_hour() {
        let floored = bucket_floor(t0(), 15);
        assert_eq!(floored, Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap());
        let late = Utc.with_ymd_and_hms(2025, 6, 2, 14, 59, 30).unwrap();
        assert_eq!(
            bucket_floor(late, 15),
            Utc.with_ymd_and_hms(2025, 6, 2, 14, 45, 0).unwrap()
        );
    }

    #[test]
    fn execution_without_market_data_has_no_context() {
        let m = monitor();
        let record = m.record_execution(
            "e1", "AAPL", Side::Buy, 10.0, 100.0, "paper", t0(), t0(), 0.0,
        );
        assert!(record.mid_at_submit.is_none());
        assert!(record.slippage_vs_mid_submit_bps.is_none());
        assert!(record.vwap_window.is_none());
    }

    #[test]
    fn execution_metrics_computed_from_market_data() {
        let m = monitor();
        let submit = t0();
        let fill = t0() + Duration::seconds(2);

        m.record_market_data("AAPL", 100.0, 1_000.0, submit);
        m.record_market_data("AAPL", 100.2, 1_000.0, fill);

        let record = m.record_execution(
            "e1", "AAPL", Side::Buy, 10.0, 100.3, "paper", submit, fill, 0.01,
        );

        // mid at submit 100.0, at fill 100.2.
        assert!((record.slippage_vs_mid_submit_bps.unwrap() - 30.0).abs() < 1e-6);
        assert!((record.slippage_vs_mid_fill_bps.unwrap() - 9.98).abs() < 1e-2);
        // VWAP over window: (100.0 + 100.2) / 2 weighted equally.
        assert!((record.vwap_window.unwrap() - 100.1).abs() < 1e-9);
        // Mid moved up 20 bps against the buyer.
        assert!((record.market_impact_bps.unwrap() - 20.0).abs() < 1e-2);
        assert_eq!(record.time_to_fill_ms, 2_000);
    }

    #[test]
    fn vwap_window_excludes_stale_points() {
        let m = monitor();
        let fill = t0();
        m.record_market_data("AAPL", 50.0, 1_000.0, fill - Duration::seconds(600));
        m.record_market_data("AAPL", 100.0, 1_000.0, fill - Duration::seconds(10));

        let record = m.record_execution(
            "e1", "AAPL", Side::Buy, 1.0, 100.0, "paper", fill, fill, 0.0,
        );
        // Only the in-window point contributes.
        assert!((record.vwap_window.unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn buckets_aggregate_by_venue_and_symbol() {
        let m = monitor();
        m.record_market_data("AAPL", 100.0, 1_000.0, t0());

        m.record_execution("e1", "AAPL", Side::Buy, 10.0, 100.1, "paper", t0(), t0(), 0.0);
        m.record_execution("e2", "AAPL", Side::Buy, 5.0, 100.3, "paper", t0(), t0(), 0.0);
        m.record_execution("e3", "AAPL", Side::Buy, 2.0, 100.0, "dark", t0(), t0(), 0.0);

        let paper = m.report(Some("paper"), Some("AAPL"), 24 * 365);
        assert_eq!(paper.len(), 1);
        assert_eq!(paper[0].execution_count, 2);
        assert!((paper[0].total_volume - 15.0).abs() < 1e-9);
        // avg of 10 bps and 30 bps (reference 100.0).
        assert!((paper[0].avg_slippage_vs_mid_bps - 20.0).abs() < 1e-6);

        let comparison = m.venue_comparison(24 * 365);
        assert!(comparison.get("paper").is_some());
        assert!(comparison.get("dark").is_some());
    }

    #[test]
    fn execution_history_is_bounded() {
        let m = QualityMonitor::new(QualityConfig {
            max_executions: 10,
            ..QualityConfig::default()
        });
        for i in 0..25 {
            m.record_execution(
                &format!("e{i}"),
                "AAPL",
                Side::Buy,
                1.0,
                100.0,
                "paper",
                t0(),
                t0(),
                0.0,
            );
        }
        assert_eq!(m.execution_count(), 10);
        assert!(m.get_execution("e0").is_none());
        assert!(m.get_execution("e24").is_some());
    }

    #[test]
    fn state_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quality.json");
        let config = QualityConfig {
            data_path: Some(path.clone()),
            ..QualityConfig::default()
        };

        {
            let m = QualityMonitor::new(config.clone());
            m.record_execution(
                "e1",
                "AAPL",
                Side::Buy,
                1.0,
                100.0,
                "paper",
                Utc::now(),
                Utc::now(),
                0.0,
            );
        }

        let restored = QualityMonitor::new(config);
        assert_eq!(restored.execution_count(), 1);
        assert!(restored.get_execution("e1").is_some());
        assert_eq!(restored.report(Some("paper"), None, 24).len(), 1);
    }
}
