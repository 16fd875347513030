// =============================================================================
// REST API -- thin control plane over the lab components
// =============================================================================
//
// Routes translate between HTTP and the component operations; no business
// logic lives here. Guardrail blocks and validation failures surface as
// structured result objects, not error responses.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::api::ws::ws_handler;
use crate::app_state::AppState;
use crate::engine::RunParams;
use crate::types::{OpResult, Side, Signal};

/// Build the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        // Engine control
        .route("/api/v1/engine/start", post(engine_start))
        .route("/api/v1/engine/stop", post(engine_stop))
        .route("/api/v1/engine/status", get(engine_status))
        .route("/api/v1/engine/signal", post(engine_signal))
        .route("/api/v1/engine/emergency-stop", post(emergency_stop))
        .route("/api/v1/engine/resume", post(emergency_resume))
        // Theory control
        .route("/api/v1/theories", get(theories_list))
        .route("/api/v1/theories/describe", get(theories_describe))
        .route("/api/v1/theories/:id/enable", post(theory_enable))
        .route("/api/v1/theories/:id/disable", post(theory_disable))
        // Allocator observability
        .route("/api/v1/allocator/performance", get(allocator_performance))
        .route("/api/v1/allocator/algorithm", get(allocator_algorithm))
        .route("/api/v1/allocator/reset/:id", post(allocator_reset))
        // Broadcast hub
        .route("/api/v1/hub/stats", get(hub_stats))
        .route("/api/v1/hub/queue/:channel", get(hub_queue))
        // Guardrails
        .route("/api/v1/guardrails/check", post(guardrails_check))
        .route("/api/v1/guardrails/stats", get(guardrails_stats))
        // Execution quality
        .route("/api/v1/quality/report", get(quality_report))
        .route("/api/v1/quality/venues", get(quality_venues))
        // Learner
        .route("/api/v1/learner/predict", post(learner_predict))
        .route("/api/v1/learner/report", get(learner_report))
        // WebSocket subscriber endpoint
        .route("/api/v1/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Optional overrides for a run; anything omitted comes from the lab config.
#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    universe: Option<Vec<String>>,
    theories: Option<Vec<String>>,
    max_concurrency: Option<usize>,
    max_trades_per_minute: Option<usize>,
    microtrade_notional: Option<f64>,
    max_exposure_notional: Option<f64>,
}

async fn engine_start(
    State(state): State<Arc<AppState>>,
    body: Option<Json<StartRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let mut params: RunParams = state.config.read().run_params();
    if let Some(universe) = request.universe {
        params.universe = universe;
    }
    if let Some(theories) = request.theories {
        params.theories = theories;
    }
    if let Some(v) = request.max_concurrency {
        params.max_concurrency = v;
    }
    if let Some(v) = request.max_trades_per_minute {
        params.max_trades_per_minute = v;
    }
    if let Some(v) = request.microtrade_notional {
        params.microtrade_notional = v;
    }
    if let Some(v) = request.max_exposure_notional {
        params.max_exposure_notional = v;
    }

    match state.engine.start(params).await {
        Ok(run_id) => Json(json!({ "ok": true, "status": "running", "run_id": run_id }))
            .into_response(),
        Err(reason) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(OpResult::rejected("invalid_params", reason)),
        )
            .into_response(),
    }
}

async fn engine_stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let summary = state.engine.stop().await;
    Json(json!({ "ok": true, "status": "stopped", "summary": summary }))
}

async fn engine_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.get_status())
}

#[derive(Debug, Deserialize)]
struct SignalRequest {
    theory_id: String,
    symbol: String,
    side: Side,
    confidence: f64,
    #[serde(default = "default_horizon")]
    horizon_mins: i64,
}

fn default_horizon() -> i64 {
    5
}

async fn engine_signal(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SignalRequest>,
) -> impl IntoResponse {
    let features = state
        .features
        .compute_features(&request.symbol)
        .unwrap_or_default();
    let signal = Signal::new(
        &request.theory_id,
        &request.symbol,
        request.side,
        request.confidence,
        request.horizon_mins,
        features,
    );
    let signal_id = signal.signal_id;
    if state.engine.submit_signal(signal) {
        Json(json!({ "ok": true, "status": "accepted", "signal_id": signal_id }))
    } else {
        Json(json!({ "ok": false, "status": "rejected", "reason": "engine not running or queue full" }))
    }
}

async fn emergency_stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.guardrails.activate_emergency_stop("api request");
    Json(OpResult::ok("emergency_stopped"))
}

async fn emergency_resume(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.guardrails.deactivate_emergency_stop();
    Json(OpResult::ok("resumed"))
}

// ---------------------------------------------------------------------------
// Theories
// ---------------------------------------------------------------------------

async fn theories_list(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.statuses())
}

async fn theories_describe(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.describe_all())
}

async fn theory_enable(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.registry.enable(&id) {
        Json(OpResult::ok("enabled")).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(OpResult::rejected("unknown_theory", id)),
        )
            .into_response()
    }
}

async fn theory_disable(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.registry.disable(&id) {
        Json(OpResult::ok("disabled")).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(OpResult::rejected("unknown_theory", id)),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

async fn allocator_performance(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.allocator.get_performance_summary())
}

async fn allocator_algorithm(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "algorithm": state.allocator.algorithm().to_string() }))
}

async fn allocator_reset(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.allocator.reset_theory(&id) {
        Json(OpResult::ok("reset")).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(OpResult::rejected("unknown_theory", id)),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

async fn hub_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.hub.stats())
}

async fn hub_queue(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
) -> impl IntoResponse {
    let (size, capacity, ratio) = state.hub.get_queue_utilization(&channel);
    Json(json!({ "channel": channel, "size": size, "capacity": capacity, "ratio": ratio }))
}

// ---------------------------------------------------------------------------
// Guardrails
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CheckTradeRequest {
    symbol: String,
    quantity: f64,
    estimated_price: f64,
    #[serde(default = "default_regime")]
    regime: String,
}

fn default_regime() -> String {
    "base".to_string()
}

async fn guardrails_check(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CheckTradeRequest>,
) -> impl IntoResponse {
    Json(state.guardrails.check_trade(
        &request.symbol,
        request.quantity,
        request.estimated_price,
        &request.regime,
    ))
}

async fn guardrails_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.guardrails.stats())
}

// ---------------------------------------------------------------------------
// Quality
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct QualityQuery {
    venue: Option<String>,
    symbol: Option<String>,
    #[serde(default = "default_hours")]
    hours: i64,
}

fn default_hours() -> i64 {
    24
}

async fn quality_report(
    State(state): State<Arc<AppState>>,
    Query(query): Query<QualityQuery>,
) -> impl IntoResponse {
    Json(state.quality.report(
        query.venue.as_deref(),
        query.symbol.as_deref(),
        query.hours,
    ))
}

async fn quality_venues(
    State(state): State<Arc<AppState>>,
    Query(query): Query<QualityQuery>,
) -> impl IntoResponse {
    Json(state.quality.venue_comparison(query.hours))
}

// ---------------------------------------------------------------------------
// Learner
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PredictRequest {
    features: Vec<HashMap<String, f64>>,
}

async fn learner_predict(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PredictRequest>,
) -> impl IntoResponse {
    // Map named features onto the learner's fixed input ordering.
    let rows: Vec<Vec<f64>> = request
        .features
        .iter()
        .map(|row| {
            crate::features::LEARNING_FEATURE_NAMES
                .iter()
                .map(|name| row.get(*name).copied().unwrap_or(0.0))
                .collect()
        })
        .collect();
    Json(state.learner.lock().predict(&rows))
}

async fn learner_report(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let path = state.config.read().learn_report_path.clone();
    match std::fs::read_to_string(&path) {
        Ok(content) => match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(report) => Json(report).into_response(),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(OpResult::rejected("unreadable_report", path.display().to_string())),
            )
                .into_response(),
        },
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(OpResult::rejected("no_report", "nightly job has not run yet")),
        )
            .into_response(),
    }
}
