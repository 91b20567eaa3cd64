//! `/load`, `/unload`, `/delete`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use lemonade_core::adapter::LoadOptions;
use lemonade_core::CoreError;
use serde::Deserialize;
use serde_json::json;

use crate::error::GatewayError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/load", post(load))
        .route("/unload", post(unload))
        .route("/delete", post(delete))
}

#[derive(Deserialize)]
struct LoadRequest {
    model_name: String,
    ctx_size: Option<u32>,
    #[serde(default)]
    llamacpp_backend: Option<String>,
    #[serde(default)]
    llamacpp_args: Vec<String>,
}

async fn load(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoadRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let options = LoadOptions {
        ctx_size: req.ctx_size.or(Some(state.config.default_ctx_size)),
        gpu_layers: None,
        oga_variant: None,
        extra_args: req.llamacpp_args,
    };
    let _ = &req.llamacpp_backend;

    let summary = state.router.load(&req.model_name, options).await.map_err(GatewayError::Core)?;
    Ok(Json(json!({
        "status": "success",
        "model_name": summary.model_name,
        "checkpoint": summary.checkpoint,
        "recipe": summary.recipe.to_string(),
    })))
}

#[derive(Deserialize, Default)]
struct UnloadRequest {
    model_name: Option<String>,
}

async fn unload(
    State(state): State<Arc<AppState>>,
    body: Option<Json<UnloadRequest>>,
) -> Result<impl IntoResponse, GatewayError> {
    let model_name = body.and_then(|Json(b)| b.model_name);
    state
        .router
        .unload(model_name.as_deref())
        .await
        .map_err(GatewayError::Core)?;
    Ok(Json(json!({"status": "success"})))
}

#[derive(Deserialize)]
struct DeleteRequest {
    model_name: String,
}

/// §5's "retries on transient in-use errors": three attempts, 5 s apart, before
/// giving up and surfacing the conflict to the caller.
const DELETE_RETRY_ATTEMPTS: u32 = 3;
const DELETE_RETRY_DELAY: Duration = Duration::from_secs(5);

async fn delete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let entry = state
        .registry
        .get(&req.model_name)
        .await
        .ok_or_else(|| GatewayError::Core(CoreError::NotFound(req.model_name.clone())))?;

    if state.router.is_ready(&req.model_name).await {
        state
            .router
            .unload(Some(&req.model_name))
            .await
            .map_err(GatewayError::Core)?;
    }

    let (repo_id, _variant) = entry.repo_and_variant();
    let mut attempt = 0;
    loop {
        match state.artifacts.delete(repo_id) {
            Ok(()) => break,
            Err(CoreError::InUse(msg)) if attempt + 1 < DELETE_RETRY_ATTEMPTS => {
                attempt += 1;
                tracing::warn!(model = %req.model_name, attempt, %msg, "delete retrying after in-use error");
                tokio::time::sleep(DELETE_RETRY_DELAY).await;
            }
            Err(e) => return Err(GatewayError::Core(e)),
        }
    }

    if entry.source != lemonade_core::model::Source::Builtin {
        state.registry.unregister_user(&req.model_name).await.map_err(GatewayError::Core)?;
    } else {
        state.registry.clear_downloaded(&req.model_name).await;
    }

    Ok(Json(json!({"status": "success", "model_name": req.model_name})))
}
