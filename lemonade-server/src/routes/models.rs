//! `/models`, `/models/{id}`, `/add-local-model`.

use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use lemonade_core::registry::ListFilter;
use lemonade_core::model::{ModelEntry, Source};
use serde::Deserialize;
use serde_json::json;

use crate::error::GatewayError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/models", get(list_models))
        .route("/models/{id}", get(get_model))
        .route("/add-local-model", post(add_local_model))
}

#[derive(Deserialize, Default)]
struct ListModelsQuery {
    #[serde(default)]
    show_all: bool,
}

fn to_openai_shape(entry: &ModelEntry) -> serde_json::Value {
    json!({
        "id": entry.name,
        "object": "model",
        "checkpoint": entry.checkpoint,
        "recipe": entry.backend_kind.to_string(),
        "labels": entry.labels,
        "downloaded": entry.downloaded,
    })
}

async fn list_models(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListModelsQuery>,
) -> impl IntoResponse {
    let filter = ListFilter {
        downloaded_only: !query.show_all,
        ..Default::default()
    };
    let entries = state.registry.list(&filter).await;
    Json(json!({
        "object": "list",
        "data": entries.iter().map(to_openai_shape).collect::<Vec<_>>(),
    }))
}

async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let entry = state
        .registry
        .get(&id)
        .await
        .ok_or_else(|| GatewayError::Core(lemonade_core::CoreError::NotFound(id.clone())))?;
    Ok(Json(to_openai_shape(&entry)))
}

/// §4.G `/add-local-model`: registers a `user.*` entry whose artifact files are
/// embedded in the multipart body, placing them under the store's deterministic
/// layout before the registry write so `resolve` finds them on the first `load`.
async fn add_local_model(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, GatewayError> {
    let mut name: Option<String> = None;
    let mut backend_kind: Option<lemonade_core::model::BackendKind> = None;
    let mut checkpoint: Option<String> = None;
    let mut file_field: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GatewayError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "name" => {
                name = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| GatewayError::BadRequest(e.to_string()))?,
                )
            }
            "backend_kind" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
                backend_kind = Some(
                    raw.parse()
                        .map_err(|_| GatewayError::BadRequest(format!("unknown backend_kind {raw:?}")))?,
                );
            }
            "file" => {
                let filename = field.file_name().unwrap_or("model.bin").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
                file_field = Some((filename, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let name = name.ok_or_else(|| GatewayError::BadRequest("missing field 'name'".to_string()))?;
    if !ModelEntry::is_user_name(&name) {
        return Err(GatewayError::BadRequest(format!(
            "user model names must start with 'user.', got {name:?}"
        )));
    }
    let backend_kind =
        backend_kind.ok_or_else(|| GatewayError::BadRequest("missing field 'backend_kind'".to_string()))?;
    let (filename, bytes) =
        file_field.ok_or_else(|| GatewayError::BadRequest("missing multipart field 'file'".to_string()))?;

    let repo_id = format!("local/{name}");
    checkpoint.get_or_insert_with(|| repo_id.clone());

    let mut writer = state
        .artifacts
        .open_writer(&repo_id, "main", &filename)
        .await
        .map_err(GatewayError::Core)?;
    writer.write_chunk(&bytes).await.map_err(GatewayError::Core)?;
    writer.finish().await.map_err(GatewayError::Core)?;

    let entry = ModelEntry {
        name: name.clone(),
        checkpoint: checkpoint.unwrap_or(repo_id),
        backend_kind,
        mmproj: None,
        labels: Default::default(),
        source: Source::UserUpload,
        suggested: false,
        downloaded: true,
        resolved_path: None,
    };
    state.registry.register_user(entry).await.map_err(GatewayError::Core)?;

    Ok(Json(json!({"status": "success", "model_name": name})))
}
