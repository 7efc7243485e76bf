// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Only `/health` is public; everything
// else requires a valid Bearer token via the `AuthBearer` extractor. This is
// the thin seam §6/§10.5 describe: no session, JWT, or user-registration
// logic lives here — a real ingress service calls these handlers the same
// way these tests do.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::api::auth::AuthBearer;
use crate::engine::Engine;
use crate::types::SignalSource;

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/signals", post(submit_signal))
        .route("/api/v1/signals/broadcast", post(broadcast_signal))
        .route("/api/v1/cancel", post(cancel_all_for_symbol))
        .route("/api/v1/close-all", post(close_all_for_user))
        .route("/api/v1/status", get(status))
        .route("/api/v1/settings", get(settings))
        .layer(cors)
        .with_state(engine)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok", server_time: chrono::Utc::now().timestamp_millis() })
}

// =============================================================================
// submitSignal (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct SubmitSignalRequest {
    raw_text: String,
    user_id: String,
    #[serde(default)]
    source: SourceDto,
}

#[derive(Deserialize, Default)]
struct SourceDto {
    #[serde(default = "default_platform")]
    platform: String,
    channel: Option<String>,
    author: Option<String>,
    message_id: Option<String>,
}

fn default_platform() -> String {
    "http".to_string()
}

impl From<SourceDto> for SignalSource {
    fn from(dto: SourceDto) -> Self {
        SignalSource {
            platform: dto.platform,
            channel: dto.channel,
            author: dto.author,
            message_id: dto.message_id,
        }
    }
}

async fn submit_signal(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
    Json(req): Json<SubmitSignalRequest>,
) -> impl IntoResponse {
    let receipt = engine.submit_signal(&req.raw_text, req.source.into(), &req.user_id).await;
    Json(receipt)
}

// =============================================================================
// broadcastSignal (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct BroadcastSignalRequest {
    raw_text: String,
    #[serde(default)]
    source: SourceDto,
}

async fn broadcast_signal(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
    Json(req): Json<BroadcastSignalRequest>,
) -> impl IntoResponse {
    let summary = engine.broadcast_signal(&req.raw_text, req.source.into()).await;
    Json(summary)
}

// =============================================================================
// Administrative close-outs (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct CancelAllForSymbolRequest {
    user_id: String,
    symbol: String,
}

async fn cancel_all_for_symbol(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
    Json(req): Json<CancelAllForSymbolRequest>,
) -> impl IntoResponse {
    let receipt = engine.cancel_all_for_symbol(&req.user_id, &req.symbol).await;
    Json(receipt)
}

#[derive(Deserialize)]
struct CloseAllForUserRequest {
    user_id: String,
}

async fn close_all_for_user(
    _auth: AuthBearer,
    State(engine): State<Arc<Engine>>,
    Json(req): Json<CloseAllForUserRequest>,
) -> impl IntoResponse {
    let receipts = engine.close_all_for_user(&req.user_id).await;
    Json(receipts)
}

// =============================================================================
// Read-only queries (authenticated)
// =============================================================================

async fn status(_auth: AuthBearer, State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.status())
}

async fn settings(_auth: AuthBearer, State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.settings())
}
