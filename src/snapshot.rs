// =============================================================================
// Durability manager -- periodic snapshot and best-effort restore
// =============================================================================
//
// One JSON document holds the allocator, engine, and learner state, each in
// its own section so a corrupt section never blocks its siblings from
// restoring. Writes are atomic (tmp + rename); the snapshot runs on a
// configurable interval and once more at shutdown.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::allocator::{AllocatorState, BanditAllocator};
use crate::engine::{EngineState, TradeEngine};
use crate::guardrails::atomic_write_json;
use crate::learner::{LearnerState, OnlineLearner};

/// The on-disk snapshot document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub saved_at: String,
    pub version: u32,
    pub allocator: Option<Value>,
    pub engine: Option<Value>,
    pub learner: Option<Value>,
}

/// Which components restored successfully.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub snapshot_found: bool,
    pub allocator_restored: bool,
    pub engine_restored: bool,
    pub learner_restored: bool,
}

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub path: PathBuf,
    pub interval_mins: u64,
    /// When false, a missing-or-corrupt snapshot at boot is a fatal error
    /// (process exit code 2); corrupt sections are always tolerated.
    pub ignore_restore_errors: bool,
}

/// Collects component state and persists it as one atomic document.
pub struct SnapshotManager {
    config: SnapshotConfig,
    allocator: Arc<BanditAllocator>,
    engine: Arc<TradeEngine>,
    learner: Arc<Mutex<OnlineLearner>>,
    write_failures: Mutex<u64>,
}

impl SnapshotManager {
    pub fn new(
        config: SnapshotConfig,
        allocator: Arc<BanditAllocator>,
        engine: Arc<TradeEngine>,
        learner: Arc<Mutex<OnlineLearner>>,
    ) -> Self {
        Self {
            config,
            allocator,
            engine,
            learner,
            write_failures: Mutex::new(0),
        }
    }

    /// Collect state from every component and write the snapshot. A failed
    /// write increments a counter; the next interval retries.
    pub fn save(&self) -> Result<()> {
        let snapshot = Snapshot {
            saved_at: Utc::now().to_rfc3339(),
            version: 1,
            allocator: serde_json::to_value(self.allocator.get_state()).ok(),
            engine: serde_json::to_value(self.engine.get_state()).ok(),
            learner: serde_json::to_value(self.learner.lock().get_state()).ok(),
        };

        match atomic_write_json(&self.config.path, &snapshot) {
            Ok(()) => {
                info!(path = %self.config.path.display(), "snapshot written");
                Ok(())
            }
            Err(e) => {
                *self.write_failures.lock() += 1;
                warn!(error = %e, "snapshot write failed; will retry next interval");
                Err(e)
            }
        }
    }

    /// Restore each component from the most recent snapshot, best-effort
    /// per component. A missing file is not an error; an unreadable file is
    /// (the caller maps it to exit code 2 unless overridden by config).
    pub fn restore(&self) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();

        let content = match std::fs::read_to_string(&self.config.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.config.path.display(), "no snapshot found; starting fresh");
                return Ok(report);
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("reading snapshot from {}", self.config.path.display())
                })
            }
        };
        let snapshot: Snapshot =
            serde_json::from_str(&content).context("parsing snapshot document")?;
        report.snapshot_found = true;

        if let Some(value) = snapshot.allocator {
            match serde_json::from_value::<AllocatorState>(value) {
                Ok(state) => {
                    self.allocator.set_state(state);
                    report.allocator_restored = true;
                }
                Err(e) => warn!(error = %e, "allocator snapshot section unreadable"),
            }
        }

        if let Some(value) = snapshot.engine {
            match serde_json::from_value::<EngineState>(value) {
                Ok(state) => {
                    // Static params and positions only; in-flight signals
                    // are dropped by design.
                    self.engine.set_state(state);
                    report.engine_restored = true;
                }
                Err(e) => warn!(error = %e, "engine snapshot section unreadable"),
            }
        }

        if let Some(value) = snapshot.learner {
            match serde_json::from_value::<LearnerState>(value) {
                Ok(state) => {
                    self.learner.lock().set_state(state);
                    report.learner_restored = true;
                }
                Err(e) => warn!(error = %e, "learner snapshot section unreadable"),
            }
        }

        info!(
            saved_at = %snapshot.saved_at,
            allocator = report.allocator_restored,
            engine = report.engine_restored,
            learner = report.learner_restored,
            "snapshot restore complete"
        );
        Ok(report)
    }

    pub fn write_failures(&self) -> u64 {
        *self.write_failures.lock()
    }

    pub fn ignore_restore_errors(&self) -> bool {
        self.config.ignore_restore_errors
    }

    /// Periodic snapshot loop; runs until the task is aborted.
    pub async fn run_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.interval_mins.max(1) * 60);
        info!(interval_mins = self.config.interval_mins, "snapshot loop started");
        loop {
            tokio::time::sleep(interval).await;
            let _ = self.save();
        }
    }
}
