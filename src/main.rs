// =============================================================================
// Meridian Lab -- Main Entry Point
// =============================================================================
//
// Autonomous paper-trading laboratory: a simulated market feed drives
// theories, a bandit allocator routes flow, a paper broker fills
// micro-trades, and labeled outcomes train an online learner. Live state
// fans out to WebSocket subscribers through the broadcast hub.
//
// Exit codes: 0 normal, 1 fatal error during start, 2 snapshot restore
// failure (unless overridden by config).
// =============================================================================

mod allocator;
mod api;
mod app_state;
mod broker;
mod config;
mod engine;
mod features;
mod guardrails;
mod hub;
mod learn_report;
mod learner;
mod market_data;
mod quality;
mod snapshot;
mod theories;
mod types;
mod worker;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::LabConfig;
use crate::snapshot::SnapshotManager;
use crate::worker::PaperWorker;

const CONFIG_PATH: &str = "lab_config.json";
/// Bars of history synthesized before the live loop starts, enough for the
/// longest indicator lookback.
const BACKFILL_BARS: usize = 60;

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           Meridian Lab — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 1. Configuration ─────────────────────────────────────────────────
    let mut config = LabConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        LabConfig::default()
    });
    config.apply_env();

    info!(
        symbols = ?config.symbols,
        theories = ?config.theories,
        bandit = %config.bandit_algorithm,
        learner = %config.learner_backend,
        "lab configured"
    );

    // ── 2. Shared state ──────────────────────────────────────────────────
    let state = AppState::new(config);

    // ── 3. Snapshot restore (before any background task starts) ─────────
    let snapshot_manager = Arc::new(SnapshotManager::new(
        state.config.read().snapshot_config(),
        state.allocator.clone(),
        state.engine.clone(),
        state.learner.clone(),
    ));
    match snapshot_manager.restore() {
        Ok(report) => {
            if report.snapshot_found {
                info!(
                    allocator = report.allocator_restored,
                    engine = report.engine_restored,
                    learner = report.learner_restored,
                    "restored from snapshot"
                );
            }
        }
        Err(e) => {
            if snapshot_manager.ignore_restore_errors() {
                warn!(error = %e, "snapshot restore failed; continuing from defaults");
            } else {
                error!(error = %e, "snapshot restore failed");
                std::process::exit(2);
            }
        }
    }

    // ── 4. Seed market history and start the run ─────────────────────────
    state.feed.backfill(&state.window, BACKFILL_BARS);

    let run_params = state.config.read().run_params();
    let run_id = match state.engine.start(run_params).await {
        Ok(run_id) => run_id,
        Err(reason) => {
            error!(reason, "failed to start paper trading run");
            std::process::exit(1);
        }
    };
    info!(run_id = %run_id, "paper trading run active");

    // ── 5. Background loops ──────────────────────────────────────────────
    let worker = PaperWorker::new(state.clone());
    let worker_tasks = worker.spawn();

    let snapshot_task = tokio::spawn(snapshot_manager.clone().run_loop());

    // ── 6. API server ────────────────────────────────────────────────────
    let bind_addr = state.config.read().bind_addr.clone();
    let api_state = state.clone();
    let api_task = tokio::spawn(async move {
        let app = api::rest::router(api_state);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "API server listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "API server failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind API server"),
        }
    });

    info!("all subsystems running; press Ctrl+C to stop");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    warn!("shutdown signal received -- stopping gracefully");

    for task in worker_tasks {
        task.abort();
    }
    snapshot_task.abort();
    api_task.abort();

    let summary = state.engine.stop().await;
    info!(
        total_trades = summary.total_trades,
        total_pnl = summary.total_pnl,
        duration_mins = summary.duration_mins,
        "run summary"
    );

    state.hub.stop();

    if let Err(e) = snapshot_manager.save() {
        error!(error = %e, "final snapshot failed");
    }
    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save lab config on shutdown");
    }

    info!("Meridian Lab shut down complete.");
}
