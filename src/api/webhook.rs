// =============================================================================
// Webhook ingress + operational health endpoints — Axum 0.7
// =============================================================================
//
// `POST /webhook` is the one externally-facing write endpoint: a TradingView
// (or compatible) alert body, authenticated by the per-user secret embedded
// in the payload rather than a bearer token. Everything else here is a plain
// read endpoint with no authentication, matching the low-friction health
// surface these alerting integrations expect to poll.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Json, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use tracing::instrument;

use crate::app_state::AppState;
use crate::dispatcher::DispatchOutcome;
use crate::signal::WebhookPayload;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/health", get(health))
        .route("/positions", get(positions))
        .route("/health/ai-worker", get(health_ai_worker))
        .with_state(state)
}

#[instrument(skip(state, payload), name = "api::webhook")]
async fn webhook(State(state): State<Arc<AppState>>, Json(payload): Json<WebhookPayload>) -> Response {
    let started = Instant::now();
    match state.dispatcher.handle_webhook(payload).await {
        Ok(DispatchOutcome::Opened(trade)) => Json(json!({
            "success": true,
            "action": "opened",
            "symbol": trade.symbol,
            "exchange": trade.venue.as_str(),
            "quantity": trade.quantity,
            "entryPrice": trade.entry_price,
            "orderId": trade.order_id,
            "durationMs": started.elapsed().as_millis() as u64,
        }))
        .into_response(),
        Ok(DispatchOutcome::Closed(trade)) => Json(json!({
            "success": true,
            "action": "closed",
            "symbol": trade.symbol,
            "exchange": trade.venue.as_str(),
            "quantity": trade.quantity,
            "entryPrice": trade.exit_price,
            "orderId": trade.order_id,
            "durationMs": started.elapsed().as_millis() as u64,
        }))
        .into_response(),
        Ok(DispatchOutcome::MlBlocked { confidence, threshold, reasons }) => Json(json!({
            "success": false,
            "blockedByML": true,
            "confidence": confidence,
            "threshold": threshold,
            "reasons": reasons,
        }))
        .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "uptime": state.uptime_seconds(),
        "openPositions": state.tracker.all().len(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response()
}

async fn positions(State(state): State<Arc<AppState>>) -> Response {
    let snapshot: Vec<_> = state
        .tracker
        .all()
        .into_iter()
        .map(|(key, record)| {
            json!({
                "userId": key.user_id,
                "venue": key.venue.as_str(),
                "symbol": key.symbol,
                "side": record.side.to_string(),
                "quantity": record.quantity,
                "entryPrice": record.entry_price,
                "markPrice": record.mark_price,
                "unrealizedPnlUsd": record.unrealized_pnl_usd,
                "stopLossPrice": record.stop_loss_price,
                "takeProfitPrice": record.take_profit_price,
                "openedAt": record.opened_at.to_rfc3339(),
                "synced": record.synced,
            })
        })
        .collect();
    Json(json!({ "positions": snapshot })).into_response()
}

async fn health_ai_worker(State(state): State<Arc<AppState>>) -> Response {
    match &state.ml {
        Some(ml) => Json(json!({
            "configured": true,
            "confidenceThreshold": ml.confidence_threshold(),
        }))
        .into_response(),
        None => Json(json!({
            "configured": false,
        }))
        .into_response(),
    }
}
