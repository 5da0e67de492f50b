// =============================================================================
// REST API — thin axum adapter over `Engine`
// =============================================================================
//
// Every handler here does nothing but parse a request, call one `Engine`
// method, and map the result onto a JSON response. No detection/confluence/
// veto logic lives in this file — it is a caller of `Engine`, never a second
// source of truth. CORS stays permissive for development. Per-user
// authentication is out of scope, so no bearer-token guard sits in front of
// these routes.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::types::Bar;

pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/upload_csv", get(method_not_allowed).post(upload_csv))
        .route("/api/v1/data_status", get(data_status))
        .route("/api/v1/signals_latest", get(signals_latest))
        .route("/api/v1/scalp_card", get(scalp_card))
        .route("/api/v1/stream_snapshot", get(stream_snapshot))
        .route("/api/v1/live/start", get(method_not_allowed).post(live_start))
        .route("/api/v1/live/stop", get(method_not_allowed).post(live_stop))
        .route("/api/v1/live/status", get(live_status))
        .route("/api/v1/mtf/start", get(method_not_allowed).post(mtf_start))
        .route("/api/v1/mtf/stop", get(method_not_allowed).post(mtf_stop))
        .route("/api/v1/mtf/status", get(mtf_status))
        .route("/api/v1/mtf/confluence", get(mtf_confluence))
        .route("/api/v1/stream/start", get(method_not_allowed).post(stream_start))
        .route("/api/v1/stream/stop", get(method_not_allowed).post(stream_stop))
        .route("/api/v1/stream/status", get(stream_status))
        .route("/api/v1/backtest", get(method_not_allowed).post(run_backtest))
        .route("/api/v1/backtest/:id", get(get_backtest))
        .route(
            "/api/v1/config",
            get(get_config).patch(patch_config),
        )
        .route("/api/v1/signals_stream", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(engine)
}

async fn method_not_allowed() -> impl IntoResponse {
    StatusCode::METHOD_NOT_ALLOWED
}

// =============================================================================
// Error mapping — EngineError → {error: {kind, message, details}}
// =============================================================================

fn engine_error_to_json(err: EngineError) -> (StatusCode, serde_json::Value) {
    if matches!(err, EngineError::NoSignal) {
        return (StatusCode::OK, serde_json::json!({ "message": "no signal" }));
    }
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, serde_json::to_value(err.to_envelope()).unwrap())
}

fn err_response(err: EngineError) -> axum::response::Response {
    let (status, body) = engine_error_to_json(err);
    (status, Json(body)).into_response()
}

// =============================================================================
// Health
// =============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// =============================================================================
// CSV import / data status
// =============================================================================

#[derive(Deserialize)]
struct UploadCsvBody {
    content: String,
}

/// Accepts either raw CSV text (`Content-Type: text/csv`) or a JSON envelope
/// `{"content": "..."}` — whichever the caller sends.
async fn upload_csv(State(engine): State<Arc<Engine>>, body: String) -> impl IntoResponse {
    let content = match serde_json::from_str::<UploadCsvBody>(&body) {
        Ok(wrapped) => wrapped.content,
        Err(_) => body,
    };

    match engine.upload_csv(&content) {
        Ok(result) => {
            info!(rows = result.rows, "upload_csv: accepted");
            Json(serde_json::to_value(result).unwrap()).into_response()
        }
        Err(e) => {
            warn!(error = %e, "upload_csv: rejected");
            err_response(e)
        }
    }
}

async fn data_status(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.data_status())
}

// =============================================================================
// Signals / scalp card / stream snapshot
// =============================================================================

#[derive(Deserialize, Default)]
struct SignalsLatestParams {
    atr_min: Option<f64>,
    volz_min: Option<f64>,
    bbw_min: Option<f64>,
    confirm_window: Option<usize>,
    breakout_atr_mult: Option<f64>,
    vol_mult: Option<f64>,
}

async fn signals_latest(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<SignalsLatestParams>,
) -> impl IntoResponse {
    let mut params = engine.config_snapshot().strategy_params;
    if let Some(v) = q.atr_min {
        params.atr_min = v;
    }
    if let Some(v) = q.volz_min {
        params.volz_min = v;
    }
    if let Some(v) = q.bbw_min {
        params.bbw_min = v;
    }
    if let Some(v) = q.confirm_window {
        params.confirm_window = v;
    }
    if let Some(v) = q.breakout_atr_mult {
        params.breakout_atr_mult = v;
    }
    if let Some(v) = q.vol_mult {
        params.vol_mult = v;
    }

    match engine.signals_latest_with_params(&params) {
        Ok(signal) => Json(serde_json::to_value(signal).unwrap()).into_response(),
        Err(e) => err_response(e),
    }
}

#[derive(Deserialize, Default)]
struct ScalpCardParams {
    #[serde(default)]
    enable_micro_gate: bool,
    #[serde(default)]
    force: bool,
}

async fn scalp_card(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<ScalpCardParams>,
) -> impl IntoResponse {
    Json(engine.scalp_card_with_gate(q.enable_micro_gate, q.force))
}

async fn stream_snapshot(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.stream_snapshot())
}

// =============================================================================
// Live pipeline control
// =============================================================================

#[derive(Deserialize, Default)]
struct FeedUrlBody {
    url: Option<String>,
}

fn default_price_feed_url() -> String {
    std::env::var("SWING_PRICE_FEED_URL").unwrap_or_else(|_| "ws://127.0.0.1:9001/price".to_string())
}

fn default_micro_feed_url() -> String {
    std::env::var("SWING_MICRO_FEED_URL").unwrap_or_else(|_| "ws://127.0.0.1:9001/micro".to_string())
}

async fn live_start(
    State(engine): State<Arc<Engine>>,
    body: Option<Json<FeedUrlBody>>,
) -> impl IntoResponse {
    let url = body
        .and_then(|Json(b)| b.url)
        .unwrap_or_else(default_price_feed_url);
    match engine.live_start(&url) {
        Ok(()) => Json(serde_json::json!({ "started": true })).into_response(),
        Err(e) => err_response(e),
    }
}

async fn live_stop(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    engine.live_stop();
    Json(serde_json::json!({ "stopped": true }))
}

async fn live_status(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.live_status())
}

// =============================================================================
// MTF control
// =============================================================================

async fn mtf_start(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    engine.mtf_start();
    Json(serde_json::json!({ "started": true }))
}

async fn mtf_stop(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    engine.mtf_stop();
    Json(serde_json::json!({ "stopped": true }))
}

async fn mtf_status(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.mtf_status())
}

async fn mtf_confluence(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    match engine.mtf_confluence() {
        Ok(c) => Json(serde_json::to_value(c).unwrap()).into_response(),
        Err(e) => err_response(e),
    }
}

// =============================================================================
// Microstructure stream control
// =============================================================================

async fn stream_start(
    State(engine): State<Arc<Engine>>,
    body: Option<Json<FeedUrlBody>>,
) -> impl IntoResponse {
    let url = body
        .and_then(|Json(b)| b.url)
        .unwrap_or_else(default_micro_feed_url);
    match engine.stream_start(&url) {
        Ok(()) => Json(serde_json::json!({ "started": true })).into_response(),
        Err(e) => err_response(e),
    }
}

async fn stream_stop(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    engine.stream_stop();
    Json(serde_json::json!({ "stopped": true }))
}

async fn stream_status(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.stream_status())
}

// =============================================================================
// Backtest
// =============================================================================

#[derive(Deserialize)]
struct BacktestRequest {
    #[serde(default)]
    config: Option<RuntimeConfig>,
    #[serde(default)]
    bars: Option<Vec<Bar>>,
}

#[derive(Serialize)]
struct BacktestStartResponse {
    backtest_id: Uuid,
    statistics: crate::backtest::BacktestStats,
}

async fn run_backtest(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<BacktestRequest>,
) -> impl IntoResponse {
    if let Some(cfg) = req.config {
        if let Err(e) = engine.update_config(cfg) {
            return err_response(e);
        }
    }

    match engine.run_backtest(req.bars) {
        Ok((id, report)) => {
            info!(backtest_id = %id, trades = report.stats.total_trades, "backtest: completed");
            Json(serde_json::to_value(BacktestStartResponse {
                backtest_id: id,
                statistics: report.stats,
            })
            .unwrap())
            .into_response()
        }
        Err(e) => err_response(e),
    }
}

async fn get_backtest(State(engine): State<Arc<Engine>>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match engine.get_backtest(id) {
        Ok(report) => Json(serde_json::to_value(report).unwrap()).into_response(),
        Err(e) => err_response(e),
    }
}

// =============================================================================
// Configuration
// =============================================================================

async fn get_config(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.config_snapshot())
}

async fn patch_config(
    State(engine): State<Arc<Engine>>,
    Json(cfg): Json<RuntimeConfig>,
) -> impl IntoResponse {
    match engine.update_config(cfg) {
        Ok(()) => Json(serde_json::json!({ "updated": true })).into_response(),
        Err(e) => err_response(e),
    }
}
