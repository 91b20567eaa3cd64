//! `/audio/transcriptions` (multipart, whisper) and `/audio/speech` (JSON, kokoro).

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine;
use futures::StreamExt;
use lemonade_core::adapter::LoadOptions;
use lemonade_core::model::Capability;
use serde_json::json;

use crate::error::GatewayError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/audio/transcriptions", post(transcriptions))
        .route("/audio/speech", post(speech))
}

/// Whisper's south-side shape wants JSON, not multipart; extracts the uploaded file
/// into a base64 field alongside the other form fields (§4.G).
async fn transcriptions(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, GatewayError> {
    let mut model: Option<String> = None;
    let mut language: Option<String> = None;
    let mut prompt: Option<String> = None;
    let mut response_format: Option<String> = None;
    let mut temperature: Option<f32> = None;
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut file_name: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GatewayError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                file_name = Some(field.file_name().unwrap_or("audio.wav").to_string());
                file_bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| GatewayError::BadRequest(e.to_string()))?
                        .to_vec(),
                );
            }
            "model" => model = Some(text(field).await?),
            "language" => language = Some(text(field).await?),
            "prompt" => prompt = Some(text(field).await?),
            "response_format" => response_format = Some(text(field).await?),
            "temperature" => {
                temperature = Some(
                    text(field)
                        .await?
                        .parse()
                        .map_err(|_| GatewayError::BadRequest("invalid temperature".to_string()))?,
                );
            }
            _ => {}
        }
    }

    let file_bytes = file_bytes.ok_or_else(|| GatewayError::BadRequest("missing multipart field 'file'".to_string()))?;
    let model = model.ok_or_else(|| GatewayError::BadRequest("missing field 'model'".to_string()))?;

    if !state.router.is_ready(&model).await {
        state
            .router
            .auto_load_if_needed(&model, LoadOptions::default())
            .await
            .map_err(GatewayError::Core)?;
    }

    let body = json!({
        "model": model,
        "file": base64::engine::general_purpose::STANDARD.encode(&file_bytes),
        "filename": file_name,
        "language": language,
        "prompt": prompt,
        "response_format": response_format,
        "temperature": temperature,
    });

    let response = state
        .router
        .forward(Capability::AudioTranscription, &model, body)
        .await
        .map_err(GatewayError::Core)?;
    Ok(Json(response))
}

async fn text(field: axum::extract::multipart::Field<'_>) -> Result<String, GatewayError> {
    field.text().await.map_err(|e| GatewayError::BadRequest(e.to_string()))
}

/// §4.G/§11: kokoro returns raw audio, not JSON, so neither branch here can reuse
/// `Router::forward`'s `resp.json()` path — buffered goes through `forward_bytes`,
/// streaming forwards the child's chunked body verbatim like `inference.rs` does
/// for SSE.
async fn speech(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<axum::response::Response, GatewayError> {
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::BadRequest("missing field 'model'".to_string()))?
        .to_string();

    if !state.router.is_ready(&model).await {
        state
            .router
            .auto_load_if_needed(&model, LoadOptions::default())
            .await
            .map_err(GatewayError::Core)?;
    }

    let stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    if stream {
        let (byte_stream, content_type) = state
            .router
            .forward_stream(Capability::AudioSpeech, &model, body)
            .await
            .map_err(GatewayError::Core)?;
        let body_stream = byte_stream.map(|chunk| {
            chunk.map_err(|e: lemonade_core::CoreError| std::io::Error::other(e.to_string()))
        });
        return Ok(axum::response::Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type.as_deref().unwrap_or("application/octet-stream"))
            .body(Body::from_stream(body_stream))
            .expect("static response parts are always valid"));
    }

    let (bytes, content_type) = state
        .router
        .forward_bytes(Capability::AudioSpeech, &model, body)
        .await
        .map_err(GatewayError::Core)?;
    Ok(axum::response::Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type.as_deref().unwrap_or("application/octet-stream"))
        .body(Body::from(bytes))
        .expect("static response parts are always valid"))
}
