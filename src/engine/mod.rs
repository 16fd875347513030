// =============================================================================
// Trade engine -- signal intake, rate limiting, concurrency, exposure
// =============================================================================
//
// Run lifecycle:
//   initializing --start--> running
//   running --stop--> stopping --drain--> stopped
//   running / stopping --unrecoverable--> error --stop--> stopped
//
// Background tasks (all observe the status flag at their next suspension
// point and exit cleanly on stop):
//   1. signal processor  -- queue -> exposure/caps -> trade request
//   2. trade executor    -- rate limit -> semaphore -> submission task
//   3. stats updater     -- every ~10 s
//   4. task janitor      -- every ~5 s, reaps submission tasks
//
// Exposure accounting tracks the committed request notional per symbol so
// the cap holds even when the integer-share floor of one share inflates a
// fill above the micro-trade notional.
// =============================================================================

pub mod rate_limit;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Fill, Order, PaperBroker};
use crate::engine::rate_limit::RollingRateLimiter;
use crate::types::{OrderType, RunStatus, Signal, TradeRequest};

// ---------------------------------------------------------------------------
// Run parameters and statistics
// ---------------------------------------------------------------------------

/// Parameters for a paper-trading run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunParams {
    pub universe: Vec<String>,
    pub theories: Vec<String>,
    #[serde(default = "default_horizons")]
    pub horizons_mins: Vec<i64>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_trades_per_minute")]
    pub max_trades_per_minute: usize,
    #[serde(default = "default_microtrade_notional")]
    pub microtrade_notional: f64,
    #[serde(default = "default_max_exposure_notional")]
    pub max_exposure_notional: f64,
    #[serde(default = "default_max_open_trades")]
    pub max_open_trades: usize,
    #[serde(default = "default_max_trades_per_symbol")]
    pub max_trades_per_symbol: usize,
    #[serde(default = "default_true")]
    pub enable_learning: bool,
    #[serde(default)]
    pub random_seed: Option<u64>,
}

fn default_horizons() -> Vec<i64> {
    vec![5, 15, 60]
}
fn default_max_concurrency() -> usize {
    64
}
fn default_max_trades_per_minute() -> usize {
    600
}
fn default_microtrade_notional() -> f64 {
    25.0
}
fn default_max_exposure_notional() -> f64 {
    10_000.0
}
fn default_max_open_trades() -> usize {
    1_000
}
fn default_max_trades_per_symbol() -> usize {
    50
}
fn default_true() -> bool {
    true
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            universe: Vec::new(),
            theories: Vec::new(),
            horizons_mins: default_horizons(),
            max_concurrency: default_max_concurrency(),
            max_trades_per_minute: default_max_trades_per_minute(),
            microtrade_notional: default_microtrade_notional(),
            max_exposure_notional: default_max_exposure_notional(),
            max_open_trades: default_max_open_trades(),
            max_trades_per_symbol: default_max_trades_per_symbol(),
            enable_learning: true,
            random_seed: None,
        }
    }
}

impl RunParams {
    fn validate(&self) -> Result<(), String> {
        if self.universe.is_empty() {
            return Err("universe cannot be empty".to_string());
        }
        if self.theories.is_empty() {
            return Err("theories list cannot be empty".to_string());
        }
        if self.max_concurrency == 0 {
            return Err("max_concurrency must be positive".to_string());
        }
        if self.max_trades_per_minute == 0 {
            return Err("max_trades_per_minute must be positive".to_string());
        }
        if self.microtrade_notional <= 0.0 {
            return Err("microtrade_notional must be positive".to_string());
        }
        if self.max_exposure_notional <= 0.0 {
            return Err("max_exposure_notional must be positive".to_string());
        }
        Ok(())
    }
}

/// Real-time run statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub trades_executed: u64,
    pub trades_per_minute: f64,
    pub open_trades: usize,
    pub total_pnl: f64,
    pub signals_dropped: u64,
    pub requests_requeued: u64,
    pub task_errors: u64,
    pub queue_depth: usize,
    pub last_error: Option<String>,
}

/// Per-theory execution statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TheoryTradeStats {
    pub trades: u64,
    pub notional: f64,
    pub fees: f64,
    pub allocation_weight: f64,
}

/// Engine status view for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub status: RunStatus,
    pub run_id: Option<Uuid>,
    pub uptime_mins: f64,
    pub stats: RunStats,
    pub theory_stats: HashMap<String, TheoryTradeStats>,
}

/// Final summary emitted on stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Option<Uuid>,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub duration_mins: f64,
    pub total_trades: u64,
    pub avg_trades_per_minute: f64,
    pub total_pnl: f64,
    pub total_fees: f64,
    pub theory_stats: HashMap<String, TheoryTradeStats>,
}

/// A filled micro-trade paired with its originating signal, handed to the
/// labeling / learning pipeline by `drain_executions`.
#[derive(Debug, Clone)]
pub struct ExecutedTrade {
    pub signal: Signal,
    pub fill: Fill,
}

/// Durable engine state: static run parameters plus broker positions. The
/// in-flight queues are intentionally not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    pub run_id: Option<Uuid>,
    pub params: Option<RunParams>,
    pub positions: Vec<crate::broker::Position>,
    pub equity_curve: Vec<EquityPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts: DateTime<Utc>,
    pub equity: f64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

const SIGNAL_QUEUE_CAP: usize = 10_000;
const TRADE_REQUEST_QUEUE_CAP: usize = 10_000;
const EXECUTION_BUFFER_CAP: usize = 10_000;
const EQUITY_CURVE_CAP: usize = 500;

/// The orchestration core. Exclusively owns the signal queue, trade-request
/// queue, concurrency semaphore, and exposure map.
pub struct TradeEngine {
    broker: Arc<PaperBroker>,

    status: RwLock<RunStatus>,
    run_id: RwLock<Option<Uuid>>,
    params: RwLock<Option<RunParams>>,
    start_time: RwLock<Option<DateTime<Utc>>>,
    stop_time: RwLock<Option<DateTime<Utc>>>,

    signal_tx: RwLock<Option<mpsc::Sender<Signal>>>,
    /// Rolling-window rate limiter; mutated only by the executor task.
    rate_limiter: RwLock<Option<Arc<RollingRateLimiter>>>,
    /// Override for tests; production uses the 60 s window.
    rate_window: Duration,

    /// symbol -> committed signed notional.
    exposure: RwLock<HashMap<String, f64>>,
    /// symbol -> trades executed this run (per-symbol cap).
    symbol_trades: RwLock<HashMap<String, u64>>,

    stats: RwLock<RunStats>,
    theory_stats: RwLock<HashMap<String, TheoryTradeStats>>,
    equity_curve: Mutex<Vec<EquityPoint>>,

    executions: Mutex<Vec<ExecutedTrade>>,

    core_tasks: Mutex<Vec<JoinHandle<()>>>,
    submission_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TradeEngine {
    pub fn new(broker: Arc<PaperBroker>) -> Self {
        Self::with_rate_window(broker, Duration::from_secs(60))
    }

    /// Test constructor with a shortened rate-limit window.
    pub fn with_rate_window(broker: Arc<PaperBroker>, rate_window: Duration) -> Self {
        Self {
            broker,
            status: RwLock::new(RunStatus::Stopped),
            run_id: RwLock::new(None),
            params: RwLock::new(None),
            start_time: RwLock::new(None),
            stop_time: RwLock::new(None),
            signal_tx: RwLock::new(None),
            rate_limiter: RwLock::new(None),
            rate_window,
            exposure: RwLock::new(HashMap::new()),
            symbol_trades: RwLock::new(HashMap::new()),
            stats: RwLock::new(RunStats::default()),
            theory_stats: RwLock::new(HashMap::new()),
            equity_curve: Mutex::new(Vec::new()),
            executions: Mutex::new(Vec::new()),
            core_tasks: Mutex::new(Vec::new()),
            submission_tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> RunStatus {
        *self.status.read()
    }

    pub fn broker(&self) -> &Arc<PaperBroker> {
        &self.broker
    }

    pub fn params(&self) -> Option<RunParams> {
        self.params.read().clone()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start a run. Fails on invalid params or when a run is already active.
    pub async fn start(self: &Arc<Self>, params: RunParams) -> Result<Uuid, String> {
        if self.status() == RunStatus::Running {
            return Err("paper trading run already in progress".to_string());
        }
        params.validate()?;

        let run_id = Uuid::new_v4();
        *self.status.write() = RunStatus::Initializing;
        *self.run_id.write() = Some(run_id);
        *self.start_time.write() = Some(Utc::now());
        *self.stop_time.write() = None;

        *self.stats.write() = RunStats::default();
        *self.theory_stats.write() = params
            .theories
            .iter()
            .map(|t| (t.clone(), TheoryTradeStats::default()))
            .collect();
        self.exposure.write().clear();
        self.symbol_trades.write().clear();
        self.equity_curve.lock().clear();

        let (signal_tx, signal_rx) = mpsc::channel::<Signal>(SIGNAL_QUEUE_CAP);
        let (request_tx, request_rx) = mpsc::channel::<TradeRequest>(TRADE_REQUEST_QUEUE_CAP);
        *self.signal_tx.write() = Some(signal_tx.clone());

        let limiter = Arc::new(RollingRateLimiter::new(
            params.max_trades_per_minute,
            self.rate_window,
        ));
        *self.rate_limiter.write() = Some(limiter.clone());

        let semaphore = Arc::new(Semaphore::new(params.max_concurrency));

        info!(
            run_id = %run_id,
            universe = ?params.universe,
            theories = ?params.theories,
            max_concurrency = params.max_concurrency,
            max_trades_per_minute = params.max_trades_per_minute,
            "starting paper trading run"
        );

        *self.params.write() = Some(params);
        *self.status.write() = RunStatus::Running;

        let mut tasks = self.core_tasks.lock();
        tasks.push(tokio::spawn(
            self.clone().signal_processor(signal_rx, request_tx.clone(), signal_tx),
        ));
        tasks.push(tokio::spawn(self.clone().trade_executor(
            request_rx,
            request_tx,
            limiter,
            semaphore,
        )));
        tasks.push(tokio::spawn(self.clone().stats_updater()));
        tasks.push(tokio::spawn(self.clone().task_janitor()));
        drop(tasks);

        info!(run_id = %run_id, "paper trading run started");
        Ok(run_id)
    }

    /// Stop the run: reject new signals, drain in-flight work, emit summary.
    pub async fn stop(self: &Arc<Self>) -> RunSummary {
        let current = self.status();
        if !matches!(current, RunStatus::Running | RunStatus::Error) {
            warn!(status = %current, "no active run to stop");
            return self.summary();
        }

        info!(run_id = ?*self.run_id.read(), "stopping paper trading run");
        *self.status.write() = RunStatus::Stopping;
        *self.stop_time.write() = Some(Utc::now());
        *self.signal_tx.write() = None;

        // Tasks observe the status flag at their next suspension point.
        let core = std::mem::take(&mut *self.core_tasks.lock());
        for handle in core {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("core task did not stop within grace period");
            }
        }
        let submissions = std::mem::take(&mut *self.submission_tasks.lock());
        for handle in submissions {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }

        let summary = self.summary();
        *self.status.write() = RunStatus::Stopped;
        info!(
            run_id = ?summary.run_id,
            total_trades = summary.total_trades,
            duration_mins = summary.duration_mins,
            "paper trading run stopped"
        );
        summary
    }

    /// Queue a signal for processing. Rejects (drop-newest) when the engine
    /// is not running or the queue is full.
    pub fn submit_signal(&self, signal: Signal) -> bool {
        if self.status() != RunStatus::Running {
            return false;
        }
        let tx = self.signal_tx.read().clone();
        match tx {
            Some(tx) => match tx.try_send(signal) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    self.stats.write().signals_dropped += 1;
                    warn!(
                        signal_id = %dropped.signal_id,
                        theory_id = %dropped.theory_id,
                        "signal queue full, dropping signal"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
            None => false,
        }
    }

    pub fn get_status(&self) -> EngineStatus {
        let uptime_mins = self
            .start_time
            .read()
            .map(|t| (Utc::now() - t).num_seconds() as f64 / 60.0)
            .unwrap_or(0.0);
        EngineStatus {
            status: self.status(),
            run_id: *self.run_id.read(),
            uptime_mins,
            stats: self.stats.read().clone(),
            theory_stats: self.theory_stats.read().clone(),
        }
    }

    /// Signed committed notional per symbol.
    pub fn exposure(&self) -> HashMap<String, f64> {
        self.exposure.read().clone()
    }

    /// Return a reservation that did not turn into a fill.
    fn release_exposure(&self, symbol: &str, reserved: f64) {
        let mut exposure = self.exposure.write();
        if let Some(value) = exposure.get_mut(symbol) {
            *value -= reserved;
        }
    }

    /// Take all executions accumulated since the last drain.
    pub fn drain_executions(&self) -> Vec<ExecutedTrade> {
        std::mem::take(&mut *self.executions.lock())
    }

    /// Record the allocation weight assigned to a theory this cycle.
    pub fn record_allocation_weight(&self, theory_id: &str, weight: f64) {
        if let Some(stats) = self.theory_stats.write().get_mut(theory_id) {
            stats.allocation_weight = weight;
        }
    }

    /// Mark the run as failed. The next stop() still emits a summary.
    pub fn record_fatal(&self, reason: &str) {
        error!(reason, "engine entering error state");
        self.stats.write().last_error = Some(reason.to_string());
        *self.status.write() = RunStatus::Error;
    }

    // -------------------------------------------------------------------------
    // Durability
    // -------------------------------------------------------------------------

    pub fn get_state(&self) -> EngineState {
        let positions = self.broker.positions().into_values().collect();
        let mut curve = self.equity_curve.lock().clone();
        if curve.len() > EQUITY_CURVE_CAP {
            curve.drain(..curve.len() - EQUITY_CURVE_CAP);
        }
        EngineState {
            run_id: *self.run_id.read(),
            params: self.params.read().clone(),
            positions,
            equity_curve: curve,
        }
    }

    /// Restore static run parameters and broker positions. In-flight
    /// signals are never replayed.
    pub fn set_state(&self, state: EngineState) {
        if state.run_id.is_some() {
            *self.run_id.write() = state.run_id;
        }
        if state.params.is_some() {
            *self.params.write() = state.params;
        }
        self.broker.restore_positions(state.positions);
        *self.equity_curve.lock() = state.equity_curve;
        info!("engine state restored from snapshot");
    }

    // -------------------------------------------------------------------------
    // Background task 1: signal processor
    // -------------------------------------------------------------------------

    async fn signal_processor(
        self: Arc<Self>,
        mut signal_rx: mpsc::Receiver<Signal>,
        request_tx: mpsc::Sender<TradeRequest>,
        queue_probe: mpsc::Sender<Signal>,
    ) {
        info!("signal processor started");
        while self.status() == RunStatus::Running {
            let signal =
                match tokio::time::timeout(Duration::from_secs(1), signal_rx.recv()).await {
                    Ok(Some(signal)) => signal,
                    Ok(None) => break,
                    Err(_) => continue,
                };

            // Track queue depth from the sender side of the same channel.
            self.stats.write().queue_depth =
                queue_probe.max_capacity() - queue_probe.capacity();

            if let Some(request) = self.build_trade_request(&signal) {
                let reserved = request.signal.side.sign() * request.notional;
                let symbol = request.signal.symbol.clone();
                if request_tx.try_send(request).is_err() {
                    self.release_exposure(&symbol, reserved);
                    self.stats.write().signals_dropped += 1;
                    warn!("trade request queue full, dropping request");
                }
            }
        }
        info!("signal processor stopped");
    }

    /// Capacity checks and sizing for one signal. Returns `None` (silent
    /// drop) when any cap leaves no room.
    fn build_trade_request(&self, signal: &Signal) -> Option<TradeRequest> {
        let params = self.params.read().clone()?;

        // The run's theory set is the enablement authority here.
        if !params.theories.contains(&signal.theory_id) {
            return None;
        }

        // Run-wide open-trade cap.
        let open_trades = self.stats.read().open_trades;
        if open_trades >= params.max_open_trades {
            debug!(open_trades, cap = params.max_open_trades, "open-trade cap reached");
            return None;
        }

        // Per-symbol trade-count cap.
        let symbol_count = self
            .symbol_trades
            .read()
            .get(&signal.symbol)
            .copied()
            .unwrap_or(0);
        if symbol_count >= params.max_trades_per_symbol as u64 {
            debug!(symbol = %signal.symbol, symbol_count, "per-symbol trade cap reached");
            return None;
        }

        // Exposure headroom on committed notional. The reservation happens
        // here, before the request is enqueued, so the cap holds regardless
        // of how submission tasks interleave; a broker rejection releases
        // the reservation.
        let notional = {
            let mut exposure = self.exposure.write();
            let current = exposure.get(&signal.symbol).copied().unwrap_or(0.0);
            if current.abs() >= params.max_exposure_notional {
                debug!(
                    symbol = %signal.symbol,
                    current_exposure = current,
                    "exposure cap reached"
                );
                return None;
            }
            let notional = params
                .microtrade_notional
                .min(params.max_exposure_notional - current.abs());
            if notional <= 0.0 {
                return None;
            }
            *exposure.entry(signal.symbol.clone()).or_insert(0.0) +=
                signal.side.sign() * notional;
            notional
        };

        let price = self.broker.reference_price(&signal.symbol);
        if price <= 0.0 {
            self.release_exposure(&signal.symbol, signal.side.sign() * notional);
            return None;
        }
        let qty = ((notional / price) as i64).max(1);

        // The per-symbol count tracks committed requests, for the same
        // interleaving reason as the exposure reservation above.
        *self
            .symbol_trades
            .write()
            .entry(signal.symbol.clone())
            .or_insert(0) += 1;

        Some(TradeRequest {
            signal: signal.clone(),
            notional,
            qty,
            order_type: OrderType::Market,
        })
    }

    // -------------------------------------------------------------------------
    // Background task 2: trade executor
    // -------------------------------------------------------------------------

    async fn trade_executor(
        self: Arc<Self>,
        mut request_rx: mpsc::Receiver<TradeRequest>,
        request_tx: mpsc::Sender<TradeRequest>,
        limiter: Arc<RollingRateLimiter>,
        semaphore: Arc<Semaphore>,
    ) {
        info!("trade executor started");
        while self.status() == RunStatus::Running {
            let request =
                match tokio::time::timeout(Duration::from_secs(1), request_rx.recv()).await {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(_) => continue,
                };

            if !limiter.try_acquire() {
                // Over budget: requeue to the tail with a jittered backoff so
                // the executor neither spins nor starves later requests.
                let jitter_ms = rand::thread_rng().gen_range(50..150);
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                self.stats.write().requests_requeued += 1;
                let reserved = request.signal.side.sign() * request.notional;
                let symbol = request.signal.symbol.clone();
                if request_tx.try_send(request).is_err() {
                    self.release_exposure(&symbol, reserved);
                    self.stats.write().signals_dropped += 1;
                }
                continue;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let engine = self.clone();
            let handle = tokio::spawn(async move {
                engine.submit_to_broker(request).await;
                drop(permit);
            });
            self.submission_tasks.lock().push(handle);
        }
        info!("trade executor stopped");
    }

    // -------------------------------------------------------------------------
    // Submission task
    // -------------------------------------------------------------------------

    async fn submit_to_broker(self: Arc<Self>, request: TradeRequest) {
        let order = Order {
            symbol: request.signal.symbol.clone(),
            side: request.signal.side,
            qty: request.qty,
            order_type: request.order_type,
            limit_price: None,
            client_order_id: request.signal.signal_id,
        };

        match self.broker.submit(&order) {
            Ok(fill) => self.record_execution(&request, fill),
            Err(e) => {
                warn!(
                    symbol = %order.symbol,
                    theory = %request.signal.theory_id,
                    error = %e,
                    "broker rejected order"
                );
                // The reservation made by the signal processor is returned.
                self.release_exposure(
                    &order.symbol,
                    request.signal.side.sign() * request.notional,
                );
                self.stats.write().last_error = Some(format!("trade execution: {e}"));
            }
        }
    }

    fn record_execution(&self, request: &TradeRequest, fill: Fill) {
        {
            let mut stats = self.stats.write();
            stats.trades_executed += 1;
        }
        {
            let mut theory_stats = self.theory_stats.write();
            let entry = theory_stats
                .entry(request.signal.theory_id.clone())
                .or_default();
            entry.trades += 1;
            entry.notional += fill.avg_price * fill.qty as f64;
            entry.fees += fill.fees;
        }
        debug!(
            symbol = %fill.symbol,
            side = %fill.side,
            qty = fill.qty,
            price = fill.avg_price,
            theory = %request.signal.theory_id,
            "trade executed"
        );

        // Hand off to the labeling / learning pipeline, bounded.
        let mut executions = self.executions.lock();
        if executions.len() >= EXECUTION_BUFFER_CAP {
            executions.remove(0);
        }
        executions.push(ExecutedTrade {
            signal: request.signal.clone(),
            fill,
        });
    }

    // -------------------------------------------------------------------------
    // Background task 3: stats updater
    // -------------------------------------------------------------------------

    async fn stats_updater(self: Arc<Self>) {
        while self.interruptible_sleep(10).await {
            self.refresh_stats();
        }
    }

    /// Sleep `secs` seconds in one-second slices, returning `false` as soon
    /// as the run leaves the Running state.
    async fn interruptible_sleep(&self, secs: u64) -> bool {
        for _ in 0..secs {
            if self.status() != RunStatus::Running {
                return false;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        self.status() == RunStatus::Running
    }

    fn refresh_stats(&self) {
        let summary = self.broker.performance_summary();
        let elapsed_mins = self
            .start_time
            .read()
            .map(|t| (Utc::now() - t).num_seconds() as f64 / 60.0)
            .unwrap_or(0.0);

        let mut stats = self.stats.write();
        if elapsed_mins > 0.0 {
            stats.trades_per_minute = stats.trades_executed as f64 / elapsed_mins;
        }
        stats.total_pnl = summary.net_pnl;
        stats.open_trades = summary.num_positions;
        drop(stats);

        let mut curve = self.equity_curve.lock();
        curve.push(EquityPoint {
            ts: Utc::now(),
            equity: summary.net_pnl,
        });
        if curve.len() > EQUITY_CURVE_CAP {
            let excess = curve.len() - EQUITY_CURVE_CAP;
            curve.drain(..excess);
        }
    }

    // -------------------------------------------------------------------------
    // Background task 4: task janitor
    // -------------------------------------------------------------------------

    async fn task_janitor(self: Arc<Self>) {
        while self.interruptible_sleep(5).await {

            let finished: Vec<JoinHandle<()>> = {
                let mut tasks = self.submission_tasks.lock();
                let mut finished = Vec::new();
                let mut remaining = Vec::new();
                for handle in tasks.drain(..) {
                    if handle.is_finished() {
                        finished.push(handle);
                    } else {
                        remaining.push(handle);
                    }
                }
                *tasks = remaining;
                finished
            };

            for handle in finished {
                if let Err(e) = handle.await {
                    error!(error = %e, "submission task failed");
                    let mut stats = self.stats.write();
                    stats.task_errors += 1;
                    stats.last_error = Some(format!("submission task: {e}"));
                }
            }
        }
    }

    fn summary(&self) -> RunSummary {
        let broker_summary = self.broker.performance_summary();
        let start = *self.start_time.read();
        let stop = *self.stop_time.read();
        let duration_mins = match (start, stop) {
            (Some(s), Some(e)) => (e - s).num_seconds() as f64 / 60.0,
            _ => 0.0,
        };
        let stats = self.stats.read();
        RunSummary {
            run_id: *self.run_id.read(),
            start_time: start,
            stop_time: stop,
            duration_mins,
            total_trades: stats.trades_executed,
            avg_trades_per_minute: stats.trades_per_minute,
            total_pnl: broker_summary.net_pnl,
            total_fees: broker_summary.total_fees,
            theory_stats: self.theory_stats.read().clone(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::features::FeatureSet;
    use crate::market_data::BarWindow;
    use crate::types::Side;

    fn test_engine(rate_window: Duration) -> Arc<TradeEngine> {
        let window = Arc::new(BarWindow::new(200));
        let broker = Arc::new(PaperBroker::new(
            window,
            BrokerConfig {
                constant_slippage_bps: Some(0.0),
                fee_bps: 0.0,
                min_fee: 0.0,
                ..BrokerConfig::default()
            },
        ));
        Arc::new(TradeEngine::with_rate_window(broker, rate_window))
    }

    fn params(max_exposure: f64, max_per_minute: usize) -> RunParams {
        RunParams {
            universe: vec!["AAPL".to_string()],
            theories: vec!["mean_revert".to_string()],
            microtrade_notional: 25.0,
            max_exposure_notional: max_exposure,
            max_trades_per_minute: max_per_minute,
            max_concurrency: 8,
            ..RunParams::default()
        }
    }

    fn signal(symbol: &str) -> Signal {
        Signal::new("mean_revert", symbol, Side::Buy, 0.8, 5, FeatureSet::default())
    }

    async fn wait_for_trades(engine: &Arc<TradeEngine>, n: u64, timeout_ms: u64) {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if engine.stats.read().trades_executed >= n {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn start_validates_params() {
        let engine = test_engine(Duration::from_secs(60));
        let err = engine
            .start(RunParams {
                universe: Vec::new(),
                ..params(100.0, 10)
            })
            .await
            .unwrap_err();
        assert!(err.contains("universe"));
        assert_eq!(engine.status(), RunStatus::Stopped);

        let err = engine
            .start(RunParams {
                theories: Vec::new(),
                ..params(100.0, 10)
            })
            .await
            .unwrap_err();
        assert!(err.contains("theories"));
    }

    #[tokio::test]
    async fn submit_rejected_when_not_running() {
        let engine = test_engine(Duration::from_secs(60));
        assert!(!engine.submit_signal(signal("AAPL")));
    }

    #[tokio::test]
    async fn double_start_rejected() {
        let engine = test_engine(Duration::from_secs(60));
        engine.start(params(100.0, 10)).await.unwrap();
        assert!(engine.start(params(100.0, 10)).await.is_err());
        engine.stop().await;
    }

    #[tokio::test]
    async fn exposure_cap_blocks_fifth_signal() {
        // Cap 100, micro-notional 25, reference price 100: four signals
        // commit the full budget, the fifth never becomes a trade request.
        let engine = test_engine(Duration::from_secs(60));
        engine.start(params(100.0, 1_000)).await.unwrap();

        for _ in 0..5 {
            assert!(engine.submit_signal(signal("AAPL")));
        }
        wait_for_trades(&engine, 4, 3_000).await;
        // Give the fifth signal time to be (not) processed.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let stats = engine.stats.read().clone();
        assert_eq!(stats.trades_executed, 4);
        let exposure = engine.exposure();
        assert!((exposure["AAPL"] - 100.0).abs() < 1e-9);

        engine.stop().await;
    }

    #[tokio::test]
    async fn exposure_never_exceeds_cap_at_any_step() {
        let engine = test_engine(Duration::from_secs(60));
        engine.start(params(100.0, 1_000)).await.unwrap();

        for _ in 0..10 {
            engine.submit_signal(signal("AAPL"));
            tokio::time::sleep(Duration::from_millis(30)).await;
            let exposure = engine.exposure();
            let total: f64 = exposure.values().map(|v| v.abs()).sum();
            assert!(total <= 100.0 + 1e-9, "exposure {total} breached cap");
        }
        engine.stop().await;
    }

    #[tokio::test]
    async fn rate_limit_holds_within_window() {
        // 10 trades per 600 ms window; 15 signals submitted at once.
        let engine = test_engine(Duration::from_millis(600));
        engine
            .start(RunParams {
                max_exposure_notional: 1_000_000.0,
                max_trades_per_symbol: 1_000,
                ..params(1_000_000.0, 10)
            })
            .await
            .unwrap();

        for _ in 0..15 {
            engine.submit_signal(signal("AAPL"));
        }

        // Shortly after submission only the first window's budget has run.
        wait_for_trades(&engine, 10, 500).await;
        let first_window = engine.stats.read().trades_executed;
        assert!(first_window <= 10, "executed {first_window} in one window");

        // After the window rolls, the requeued remainder executes.
        wait_for_trades(&engine, 15, 3_000).await;
        assert_eq!(engine.stats.read().trades_executed, 15);
        assert!(engine.stats.read().requests_requeued > 0);

        engine.stop().await;
    }

    #[tokio::test]
    async fn unknown_theory_signals_are_dropped() {
        let engine = test_engine(Duration::from_secs(60));
        engine.start(params(100.0, 100)).await.unwrap();

        let rogue = Signal::new("rogue", "AAPL", Side::Buy, 0.9, 5, FeatureSet::default());
        assert!(engine.submit_signal(rogue));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.stats.read().trades_executed, 0);

        engine.stop().await;
    }

    #[tokio::test]
    async fn per_symbol_trade_cap_enforced() {
        let engine = test_engine(Duration::from_secs(60));
        engine
            .start(RunParams {
                max_trades_per_symbol: 2,
                max_exposure_notional: 1_000_000.0,
                ..params(1_000_000.0, 1_000)
            })
            .await
            .unwrap();

        for _ in 0..5 {
            engine.submit_signal(signal("AAPL"));
        }
        wait_for_trades(&engine, 2, 2_000).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.stats.read().trades_executed, 2);

        engine.stop().await;
    }

    #[tokio::test]
    async fn stop_emits_summary_with_theory_stats() {
        let engine = test_engine(Duration::from_secs(60));
        engine.start(params(1_000.0, 100)).await.unwrap();
        engine.submit_signal(signal("AAPL"));
        wait_for_trades(&engine, 1, 2_000).await;

        let summary = engine.stop().await;
        assert_eq!(engine.status(), RunStatus::Stopped);
        assert_eq!(summary.total_trades, 1);
        let theory = &summary.theory_stats["mean_revert"];
        assert_eq!(theory.trades, 1);
        assert!(theory.notional > 0.0);

        // After stop, signals are rejected.
        assert!(!engine.submit_signal(signal("AAPL")));
    }

    #[tokio::test]
    async fn executions_are_drained_once() {
        let engine = test_engine(Duration::from_secs(60));
        engine.start(params(1_000.0, 100)).await.unwrap();
        engine.submit_signal(signal("AAPL"));
        wait_for_trades(&engine, 1, 2_000).await;

        let drained = engine.drain_executions();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].signal.theory_id, "mean_revert");
        assert!(engine.drain_executions().is_empty());

        engine.stop().await;
    }

    #[tokio::test]
    async fn state_roundtrip_restores_params_and_positions() {
        let engine = test_engine(Duration::from_secs(60));
        engine.start(params(1_000.0, 100)).await.unwrap();
        engine.submit_signal(signal("AAPL"));
        wait_for_trades(&engine, 1, 2_000).await;
        engine.stop().await;

        let state = engine.get_state();
        assert!(state.run_id.is_some());
        assert_eq!(state.positions.len(), 1);

        let fresh = test_engine(Duration::from_secs(60));
        fresh.set_state(state.clone());
        assert_eq!(*fresh.run_id.read(), state.run_id);
        assert_eq!(fresh.broker().positions().len(), 1);
    }

    #[tokio::test]
    async fn fatal_error_transitions_to_error_then_stopped() {
        let engine = test_engine(Duration::from_secs(60));
        engine.start(params(1_000.0, 100)).await.unwrap();
        engine.record_fatal("configuration impossibility");
        assert_eq!(engine.status(), RunStatus::Error);

        let summary = engine.stop().await;
        assert_eq!(engine.status(), RunStatus::Stopped);
        assert!(summary.run_id.is_some());
        assert_eq!(
            engine.get_status().stats.last_error.as_deref(),
            Some("configuration impossibility")
        );
    }
}
