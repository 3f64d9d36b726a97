// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/` and are read-only.  Health is public;
// everything else requires a Bearer token via the `AuthBearer` extractor.
// Recent sells answer "was SYMBOL sold within ?hours=N" for entry logic
// running elsewhere.
//
// CORS is permissive; the server binds to localhost by default.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::api::auth::AuthBearer;
use crate::app_state::{AppState, EngineStatus};

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/rate-limit", get(rate_limit))
        .route("/api/v1/config", get(config))
        .route("/api/v1/recent-sells/:symbol", get(recent_sell))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(flatten)]
    engine: EngineStatus,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine = state.status();
    Json(HealthResponse {
        status: if engine.api_up { "ok" } else { "degraded" },
        engine,
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Positions (authenticated)
// =============================================================================

async fn positions(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.lifecycle.snapshots().await)
}

// =============================================================================
// Rate budget (authenticated)
// =============================================================================

async fn rate_limit(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.limiter.snapshot().await)
}

// =============================================================================
// Effective configuration (authenticated)
// =============================================================================

async fn config(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.clone())
}

// =============================================================================
// Recent sells (authenticated)
// =============================================================================

const DEFAULT_RECENT_SELL_HOURS: i64 = 24;
const MAX_RECENT_SELL_HOURS: i64 = 24 * 365;

#[derive(Deserialize)]
struct RecentSellQuery {
    hours: Option<i64>,
}

async fn recent_sell(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<RecentSellQuery>,
) -> impl IntoResponse {
    let hours = query
        .hours
        .unwrap_or(DEFAULT_RECENT_SELL_HOURS)
        .clamp(0, MAX_RECENT_SELL_HOURS);
    Json(state.recent_sell(&symbol, hours, chrono::Utc::now()))
}
