//! Thin presentation surface over the pipeline.
//!
//! REST for history and status, a WebSocket for live snapshots, and a
//! force-reconnect escape hatch for the terminal Failed feed state. All
//! analytics live upstream; handlers only read.

use crate::feed::resilience::ConnectionMonitor;
use crate::feed::transport::FeedHandle;
use crate::models::{MarketDataEvent, SnapshotRow};
use crate::pipeline::expiry::{market_status, ExpirySelector};
use crate::pipeline::strike::StrikeSelector;
use crate::pipeline::Broadcaster;
use crate::storage::AnalyticsStore;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    http::StatusCode,
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

const DEFAULT_HISTORY_LIMIT: usize = 500;
const MAX_HISTORY_LIMIT: usize = 5_000;

#[derive(Clone)]
pub struct AppState {
    pub broadcaster: Arc<Broadcaster>,
    pub store: Arc<AnalyticsStore>,
    pub monitor: Arc<ConnectionMonitor>,
    pub strike: Arc<StrikeSelector>,
    pub expiry: Arc<ExpirySelector>,
    pub feed: FeedHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/snapshot", get(get_snapshot))
        .route("/api/status", get(get_status))
        .route("/api/history", get(get_history))
        .route("/api/reconnect", post(post_reconnect))
        .route("/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let rows = state.store.snapshot_count().unwrap_or(-1);
    Json(serde_json::json!({
        "status": "ok",
        "connection": state.monitor.get().as_str(),
        "stored_rows": rows,
    }))
}

async fn get_snapshot(State(state): State<AppState>) -> Result<Json<MarketDataEvent>, StatusCode> {
    state
        .broadcaster
        .latest()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    connection_status: String,
    market_status: crate::models::MarketStatus,
    atm_strike: Option<f64>,
    weekly_expiry: chrono::NaiveDate,
    monthly_expiry: chrono::NaiveDate,
    subscribed_legs: Vec<String>,
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let expiries = state.expiry.current();
    Json(StatusResponse {
        connection_status: state.monitor.get().as_str().to_string(),
        market_status: market_status(chrono::Utc::now()),
        atm_strike: state.strike.current_strike(),
        weekly_expiry: expiries.weekly,
        monthly_expiry: expiries.monthly,
        subscribed_legs: state.strike.current_instruments(),
    })
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    /// Epoch milliseconds, inclusive.
    from: Option<i64>,
    to: Option<i64>,
    limit: Option<usize>,
}

async fn get_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<SnapshotRow>>, StatusCode> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let result = match (query.from, query.to) {
        (None, None) => state.store.recent_snapshots(limit),
        (from, to) => {
            state
                .store
                .snapshots_in_range(from.unwrap_or(0), to.unwrap_or(i64::MAX), limit)
        }
    };
    match result {
        Ok(rows) => Ok(Json(rows)),
        Err(e) => {
            warn!(error = %e, "history query failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn post_reconnect(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.feed.force_reconnect();
    Json(serde_json::json!({ "status": "reconnect_requested" }))
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut rx = state.broadcaster.subscribe();

    // Replay the latest snapshot so a new client is never empty-handed.
    if let Some(event) = state.broadcaster.latest() {
        let msg = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        if socket.send(Message::Text(msg)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        // Slow consumer: skip ahead, the producer never waits.
                        warn!(skipped, "ws client lagged behind broadcast");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let msg = serde_json::to_string(&event).unwrap_or_else(|e| {
                    warn!("failed to serialize market data event: {}", e);
                    "{}".to_string()
                });
                if socket.send(Message::Text(msg)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if text == "ping" => {
                        let _ = socket.send(Message::Text("pong".to_string())).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}
