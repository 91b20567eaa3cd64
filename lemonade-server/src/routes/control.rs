//! `/params` (reserved) and `/shutdown`.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/params", post(params))
        .route("/shutdown", post(shutdown))
}

async fn params() -> impl IntoResponse {
    Json(json!({"status": "success"}))
}

/// §4.I: answers immediately, then unloads every backend and signals the shutdown
/// coordinator in `main.rs` to exit once draining completes.
async fn shutdown(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.shutdown.trigger();
    tokio::spawn(async move {
        let _ = state.router.unload(None).await;
    });
    Json(json!({"status": "shutting down"}))
}
