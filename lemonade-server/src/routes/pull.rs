//! `POST /pull`: buffered or SSE download of a model's artifacts.

use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use lemonade_core::model::{BackendKind, ModelEntry, Source};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::GatewayError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/pull", post(pull))
}

#[derive(Deserialize)]
struct PullRequest {
    model_name: String,
    checkpoint: Option<String>,
    recipe: Option<BackendKind>,
    mmproj: Option<String>,
    #[serde(default)]
    do_not_upgrade: bool,
    #[serde(default)]
    stream: bool,
}

/// Ensures `req.model_name` has a registry entry, registering a `user.*` one from
/// `checkpoint`/`recipe` if it doesn't already exist (§4.C `register_user`, used here
/// as `pull`'s implicit registration step for names not already known).
async fn ensure_entry(state: &AppState, req: &PullRequest) -> Result<ModelEntry, GatewayError> {
    if let Some(entry) = state.registry.get(&req.model_name).await {
        return Ok(entry);
    }
    let checkpoint = req
        .checkpoint
        .clone()
        .ok_or_else(|| GatewayError::BadRequest("unknown model_name and no checkpoint given".to_string()))?;
    let recipe = req
        .recipe
        .ok_or_else(|| GatewayError::BadRequest("unknown model_name and no recipe given".to_string()))?;
    let entry = ModelEntry {
        name: req.model_name.clone(),
        checkpoint,
        backend_kind: recipe,
        mmproj: req.mmproj.clone(),
        labels: Default::default(),
        source: Source::UserHub,
        suggested: false,
        downloaded: false,
        resolved_path: None,
    };
    state
        .registry
        .register_user(entry.clone())
        .await
        .map_err(GatewayError::Core)?;
    Ok(entry)
}

async fn pull(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PullRequest>,
) -> Result<axum::response::Response, GatewayError> {
    let entry = ensure_entry(&state, &req).await?;
    if req.do_not_upgrade && entry.downloaded {
        return Ok(Json(json!({"status": "success", "model_name": entry.name})).into_response());
    }

    let (repo_id, _variant) = entry.repo_and_variant();
    let manifest = state.hub.list_files(repo_id, &state.artifacts).await.map_err(GatewayError::Core)?;
    let task = Arc::new(lemonade_core::hub::DownloadTask::new(repo_id.to_string(), manifest));

    if !req.stream {
        state
            .hub
            .download_files(&task, &state.artifacts, |_| {})
            .await
            .map_err(GatewayError::Core)?;
        state.registry.mark_downloaded(&entry.name, None).await;
        return Ok(Json(json!({"status": "success", "model_name": entry.name})).into_response());
    }

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Event, std::convert::Infallible>>();
    let hub = state.hub.clone();
    let artifacts = state.artifacts.clone();
    let registry = state.registry.clone();
    let name = entry.name.clone();

    tokio::spawn(async move {
        let progress_tx = tx.clone();
        let result = hub
            .download_files(&task, &artifacts, move |progress| {
                let data = serde_json::to_string(&progress).unwrap_or_default();
                // hub.rs's own final callback already carries `complete: true` with the
                // full byte/file counts filled in; forward it as the terminal frame
                // rather than synthesizing a sparser one below.
                let event_name = if progress.complete { "complete" } else { "progress" };
                let _ = progress_tx.send(Ok(Event::default().event(event_name).data(data)));
            })
            .await;

        match result {
            Ok(()) => {
                registry.mark_downloaded(&name, None).await;
            }
            Err(e) => {
                let _ = tx.send(Ok(Event::default()
                    .event("error")
                    .data(json!({"error": e.to_string()}).to_string())));
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
}
