//! `/health`, `/stats`, `/system-info`, `/log-level`, `/logs/stream`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::GatewayError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/system-info", get(system_info))
        .route("/log-level", post(set_log_level))
        .route("/logs/stream", get(logs_stream))
}

#[derive(Serialize)]
struct LogStreaming {
    sse: bool,
    websocket: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    model_loaded: Option<String>,
    all_models_loaded: Vec<String>,
    max_models: usize,
    context_size: u32,
    log_streaming: LogStreaming,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let loaded = state.router.all_loaded().await;
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        model_loaded: loaded.first().map(|l| l.model_name.clone()),
        all_models_loaded: loaded.into_iter().map(|l| l.model_name).collect(),
        max_models: lemonade_core::model::BackendKind::ALL
            .iter()
            .map(|k| k.default_capacity())
            .sum(),
        context_size: state.config.default_ctx_size,
        log_streaming: LogStreaming { sse: true, websocket: false },
    })
}

async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.router.get_stats().await)
}

#[derive(Deserialize)]
struct SystemInfoQuery {
    #[serde(default)]
    verbose: bool,
}

async fn system_info(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SystemInfoQuery>,
) -> impl IntoResponse {
    let mut sys = sysinfo::System::new_all();
    sys.refresh_all();

    let mut body = json!({
        "os": sysinfo::System::long_os_version().unwrap_or_default(),
        "cpu_count": sys.cpus().len(),
        "total_memory_bytes": sys.total_memory(),
        "available_memory_bytes": sys.available_memory(),
    });

    if query.verbose {
        let cpus: Vec<serde_json::Value> = sys
            .cpus()
            .iter()
            .map(|c| json!({"name": c.name(), "frequency_mhz": c.frequency(), "usage_percent": c.cpu_usage()}))
            .collect();
        body["cpus"] = json!(cpus);

        let loaded = state.router.all_loaded().await;
        body["loaded_backend_pids"] = json!(loaded
            .into_iter()
            .map(|l| json!({"model_name": l.model_name, "pid": l.pid}))
            .collect::<Vec<_>>());
    }

    Json(body)
}

#[derive(Deserialize)]
struct LogLevelRequest {
    level: String,
}

/// Per §4.G: sets the process log level. The actual `EnvFilter` is wired up by a
/// `tracing_subscriber::reload::Handle` passed in at startup (kept in a static by
/// `main.rs`); this handler just validates and forwards to it.
async fn set_log_level(Json(body): Json<LogLevelRequest>) -> Result<impl IntoResponse, GatewayError> {
    let filter: tracing_subscriber::EnvFilter = body
        .level
        .parse()
        .map_err(|e| GatewayError::BadRequest(format!("invalid log level {:?}: {e}", body.level)))?;
    crate::logging::reload_filter(filter)
        .map_err(|e| GatewayError::BadRequest(format!("failed to apply log level: {e}")))?;
    Ok(Json(json!({"status": "ok", "level": body.level})))
}

async fn logs_stream(
    State(state): State<Arc<AppState>>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    let path = state.config.log_file_path();
    if !path.exists() {
        return Err(GatewayError::Core(lemonade_core::CoreError::NotFound(
            "no log file configured".to_string(),
        )));
    }

    struct TailState {
        path: std::path::PathBuf,
        pos: u64,
        pending: std::collections::VecDeque<String>,
    }

    let initial_pos = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
    let seed = TailState {
        path,
        pos: initial_pos,
        pending: std::collections::VecDeque::new(),
    };

    let stream = futures::stream::unfold(seed, |mut st| async move {
        loop {
            if let Some(line) = st.pending.pop_front() {
                return Some((Ok(Event::default().data(line)), st));
            }
            match tokio::fs::read(&st.path).await {
                Ok(data) if data.len() as u64 > st.pos => {
                    let new_bytes = data[st.pos as usize..].to_vec();
                    st.pos = data.len() as u64;
                    st.pending
                        .extend(String::from_utf8_lossy(&new_bytes).lines().map(|l| l.to_string()));
                    continue;
                }
                _ => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    return Some((Ok(Event::default().comment("heartbeat")), st));
                }
            }
        }
    });

    Ok(Sse::new(stream.boxed()).keep_alive(KeepAlive::default()))
}
