// =============================================================================
// Operational REST surface
// =============================================================================
//
// Two routes only: an open liveness probe and the token-guarded pipeline
// snapshot. Everything an operator can read here comes straight from
// AppState; nothing on this surface mutates the pipeline.
// =============================================================================

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use tower_http::cors::{Any, CorsLayer};

use crate::api::auth::AdminToken;
use crate::app_state::{AppState, StateSnapshot};

/// Assemble the API router. CORS is wide open, which suits the single-operator
/// deployments this runs in; lock the origin down before exposing it further.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(state_snapshot))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Liveness probe, unauthenticated.
async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "state_version": state.current_state_version(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

/// Full pipeline snapshot, admin only.
async fn state_snapshot(
    _admin: AdminToken,
    State(state): State<Arc<AppState>>,
) -> Json<StateSnapshot> {
    Json(state.build_snapshot())
}
