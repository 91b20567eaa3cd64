//! `/chat/completions`, `/completions`, `/embeddings`, `/reranking`, `/responses`.
//!
//! All five share the auto-load rule and capability gating from §4.G; only the
//! `Capability` and buffered-vs-SSE behavior differ per route.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use lemonade_core::adapter::LoadOptions;
use lemonade_core::model::Capability;

use crate::error::GatewayError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/completions", post(completions))
        .route("/embeddings", post(embeddings))
        .route("/reranking", post(reranking))
        .route("/responses", post(responses))
}

fn is_streaming(body: &serde_json::Value) -> bool {
    body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false)
}

fn requested_model(body: &serde_json::Value) -> Option<&str> {
    body.get("model").and_then(|v| v.as_str())
}

/// §4.G auto-load rule: resolve which name this request should run against, loading
/// it if it differs from whatever (if anything) is already loaded for this op.
async fn resolve_model(
    state: &AppState,
    body: &serde_json::Value,
    op: Capability,
) -> Result<String, GatewayError> {
    let Some(model) = requested_model(body) else {
        let loaded = state.router.all_loaded().await;
        return loaded
            .into_iter()
            .map(|l| l.model_name)
            .next()
            .ok_or_else(|| GatewayError::BadRequest("No model loaded and no model specified in request".to_string()));
    };

    if !state.router.is_ready(model).await {
        state
            .router
            .auto_load_if_needed(model, LoadOptions::default())
            .await
            .map_err(GatewayError::Core)?;
    }
    let _ = op;
    Ok(model.to_string())
}

async fn buffered(
    state: &AppState,
    op: Capability,
    body: serde_json::Value,
) -> Result<impl IntoResponse, GatewayError> {
    let model = resolve_model(state, &body, op).await?;
    let response = state.router.forward(op, &model, body).await.map_err(GatewayError::Core)?;
    Ok(Json(response))
}

async fn streaming(
    state: &AppState,
    op: Capability,
    body: serde_json::Value,
) -> Result<axum::response::Response, GatewayError> {
    let model = resolve_model(state, &body, op).await?;
    let (byte_stream, _content_type) = state
        .router
        .forward_stream(op, &model, body)
        .await
        .map_err(GatewayError::Core)?;

    // §4.D/§4.G: the child already speaks SSE framing (`data: …\n\n`, `event: name`
    // lines); bytes are forwarded exactly as received rather than reparsed into
    // axum's `Event` type, which would re-encode and double-wrap every chunk.
    let body_stream = byte_stream.map(|chunk| {
        chunk.map_err(|e: lemonade_core::CoreError| std::io::Error::other(e.to_string()))
    });

    Ok(axum::response::Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body_stream))
        .expect("static response parts are always valid"))
}

async fn dispatch(
    state: &AppState,
    op: Capability,
    body: serde_json::Value,
) -> Result<axum::response::Response, GatewayError> {
    if is_streaming(&body) {
        streaming(state, op, body).await
    } else {
        buffered(state, op, body).await.map(IntoResponse::into_response)
    }
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<axum::response::Response, GatewayError> {
    dispatch(&state, Capability::Chat, body).await
}

async fn completions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<axum::response::Response, GatewayError> {
    dispatch(&state, Capability::Completion, body).await
}

async fn embeddings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, GatewayError> {
    buffered(&state, Capability::Embeddings, body).await
}

async fn reranking(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, GatewayError> {
    buffered(&state, Capability::Reranking, body).await
}

async fn responses(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<axum::response::Response, GatewayError> {
    dispatch(&state, Capability::Responses, body).await
}
