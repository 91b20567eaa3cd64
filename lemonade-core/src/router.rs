//! The `LoadedBackend` table: auto-load, LRU eviction, per-name serialization, and
//! request forwarding.
//!
//! Grounded on `slab-core/src/runtime/backend/admission.rs`'s `ResourceManager`/
//! `Permit` (capacity-gated admission with an async wait queue) and
//! `slab-core/src/runtime/orchestrator.rs`'s cancellation-aware forwarding loop.
//! Deliberately NOT a process-wide singleton like `slab-core/src/api/mod.rs`'s
//! `OnceLock` facade — the router is owned by `AppState` and constructed once at
//! startup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::adapter::{BackendAdapter, LoadOptions};
use crate::error::CoreError;
use crate::model::{BackendKind, Capability, ModelEntry};
use crate::registry::Registry;
use crate::supervisor::{RunningBackend, Supervisor};
use crate::telemetry::Telemetry;

/// How long `auto_load_if_needed`/`load` wait for a child to become ready (§4.F).
const LOAD_READY_DEADLINE: Duration = Duration::from_secs(60);
/// HTTP timeout applied to a single forwarded request, to accommodate long
/// generations.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(600);

enum SlotState {
    Loading(Arc<Notify>),
    Ready(Box<RunningBackend>),
    Failed(String),
}

struct Slot {
    state: SlotState,
    last_used: Instant,
    checkpoint: String,
    recipe: BackendKind,
}

/// One in-flight forward against a loaded name, tracked so a concurrent `unload`
/// can wait for it instead of tearing down the child underneath it (§4.F ordering
/// guarantee).
#[derive(Default)]
struct InFlight {
    count: u32,
    drained: Option<Arc<Notify>>,
}

/// Cheaply-clonable handle onto the in-flight-request counters, shared between the
/// `Router` and any streaming response wrapper it hands out so the latter can
/// decrement its count on drop without holding a full `Arc<Router>`.
#[derive(Clone)]
struct InFlightTracker(Arc<Mutex<HashMap<String, InFlight>>>);

impl InFlightTracker {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(HashMap::new())))
    }

    async fn enter(&self, name: &str) {
        let mut map = self.0.lock().await;
        map.entry(name.to_string()).or_default().count += 1;
    }

    async fn leave(&self, name: &str) {
        let mut map = self.0.lock().await;
        if let Some(entry) = map.get_mut(name) {
            entry.count = entry.count.saturating_sub(1);
            if entry.count == 0 {
                if let Some(notify) = entry.drained.take() {
                    notify.notify_waiters();
                }
            }
        }
    }

    async fn wait_drained(&self, name: &str) {
        loop {
            let waiter = {
                let mut map = self.0.lock().await;
                match map.get_mut(name) {
                    Some(entry) if entry.count > 0 => {
                        Some(entry.drained.get_or_insert_with(|| Arc::new(Notify::new())).clone())
                    }
                    _ => None,
                }
            };
            match waiter {
                Some(notify) => notify.notified().await,
                None => break,
            }
        }
    }
}

pub struct LoadSummary {
    pub model_name: String,
    pub checkpoint: String,
    pub recipe: BackendKind,
}

pub struct LoadedInfo {
    pub model_name: String,
    pub checkpoint: String,
    pub recipe: BackendKind,
    pub pid: Option<u32>,
}

/// Owns every currently-loaded backend and mediates access to it.
pub struct Router {
    registry: Arc<Registry>,
    adapters: HashMap<BackendKind, Arc<dyn BackendAdapter>>,
    supervisor: Supervisor,
    artifacts: Arc<crate::artifact::ArtifactStore>,
    hub: Arc<crate::hub::HubClient>,
    install_root: std::path::PathBuf,
    telemetry: Arc<Telemetry>,
    client: reqwest::Client,

    slots: RwLock<HashMap<String, Slot>>,
    in_flight: InFlightTracker,
}

impl Router {
    pub fn new(
        registry: Arc<Registry>,
        adapters: Vec<Arc<dyn BackendAdapter>>,
        supervisor: Supervisor,
        artifacts: Arc<crate::artifact::ArtifactStore>,
        hub: Arc<crate::hub::HubClient>,
        install_root: std::path::PathBuf,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(FORWARD_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            registry,
            adapters: adapters.into_iter().map(|a| (a.kind(), a)).collect(),
            supervisor,
            artifacts,
            hub,
            install_root,
            telemetry,
            client,
            slots: RwLock::new(HashMap::new()),
            in_flight: InFlightTracker::new(),
        }
    }

    fn adapter_for(&self, kind: BackendKind) -> Result<Arc<dyn BackendAdapter>, CoreError> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| CoreError::Internal(format!("no adapter registered for {kind}")))
    }

    pub async fn is_ready(&self, name: &str) -> bool {
        matches!(
            self.slots.read().await.get(name).map(|s| &s.state),
            Some(SlotState::Ready(_))
        )
    }

    pub async fn all_loaded(&self) -> Vec<LoadedInfo> {
        self.slots
            .read()
            .await
            .iter()
            .filter_map(|(name, s)| match &s.state {
                SlotState::Ready(backend) => Some(LoadedInfo {
                    model_name: name.clone(),
                    checkpoint: s.checkpoint.clone(),
                    recipe: s.recipe,
                    pid: backend.pid(),
                }),
                _ => None,
            })
            .collect()
    }

    /// §4.F `auto_load_if_needed`. If `name` is already `Ready`, bumps `last_used` and
    /// returns. Otherwise resolves, downloads on miss, evicts the kind's LRU if at
    /// capacity, spawns, and waits ready.
    pub async fn auto_load_if_needed(&self, name: &str, options: LoadOptions) -> Result<LoadSummary, CoreError> {
        // Fast path: already ready, no per-name lock needed beyond a read bump.
        {
            let mut slots = self.slots.write().await;
            if let Some(slot) = slots.get_mut(name) {
                if matches!(slot.state, SlotState::Ready(_)) {
                    slot.last_used = Instant::now();
                    return Ok(LoadSummary {
                        model_name: name.to_string(),
                        checkpoint: slot.checkpoint.clone(),
                        recipe: slot.recipe,
                    });
                }
            }
        }
        self.load(name, options).await
    }

    /// §4.F `load`: the full state-machine transition, including the case where
    /// another caller is already loading the same name (awaits that in-flight
    /// `Loading` rather than racing it).
    pub async fn load(&self, name: &str, options: LoadOptions) -> Result<LoadSummary, CoreError> {
        loop {
            let notify = {
                let mut slots = self.slots.write().await;
                match slots.get(name).map(|s| &s.state) {
                    Some(SlotState::Ready(_)) => {
                        let slot = slots.get_mut(name).unwrap();
                        slot.last_used = Instant::now();
                        return Ok(LoadSummary {
                            model_name: name.to_string(),
                            checkpoint: slot.checkpoint.clone(),
                            recipe: slot.recipe,
                        });
                    }
                    Some(SlotState::Loading(notify)) => Some(notify.clone()),
                    Some(SlotState::Failed(_)) | None => {
                        let entry = self
                            .registry
                            .get(name)
                            .await
                            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
                        slots.insert(
                            name.to_string(),
                            Slot {
                                state: SlotState::Loading(Arc::new(Notify::new())),
                                last_used: Instant::now(),
                                checkpoint: entry.checkpoint.clone(),
                                recipe: entry.backend_kind,
                            },
                        );
                        None
                    }
                }
            };

            if let Some(notify) = notify {
                notify.notified().await;
                continue;
            }

            return self.do_load(name, options).await;
        }
    }

    async fn do_load(&self, name: &str, options: LoadOptions) -> Result<LoadSummary, CoreError> {
        let entry = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;

        let result = self.do_load_inner(name, &entry, options).await;

        let mut slots = self.slots.write().await;
        let notify = match slots.get(name).map(|s| &s.state) {
            Some(SlotState::Loading(n)) => n.clone(),
            _ => Arc::new(Notify::new()),
        };

        match result {
            Ok(running) => {
                slots.insert(
                    name.to_string(),
                    Slot {
                        state: SlotState::Ready(Box::new(running)),
                        last_used: Instant::now(),
                        checkpoint: entry.checkpoint.clone(),
                        recipe: entry.backend_kind,
                    },
                );
                notify.notify_waiters();
                self.registry.mark_downloaded(name, None).await;
                Ok(LoadSummary {
                    model_name: name.to_string(),
                    checkpoint: entry.checkpoint,
                    recipe: entry.backend_kind,
                })
            }
            Err(e) => {
                slots.insert(
                    name.to_string(),
                    Slot {
                        state: SlotState::Failed(e.to_string()),
                        last_used: Instant::now(),
                        checkpoint: entry.checkpoint.clone(),
                        recipe: entry.backend_kind,
                    },
                );
                notify.notify_waiters();
                Err(e)
            }
        }
    }

    async fn do_load_inner(
        &self,
        name: &str,
        entry: &ModelEntry,
        options: LoadOptions,
    ) -> Result<RunningBackend, CoreError> {
        let adapter = self.adapter_for(entry.backend_kind)?;

        if !entry.downloaded {
            let (repo_id, _variant) = entry.repo_and_variant();
            let manifest = self.hub.list_files(repo_id, &self.artifacts).await?;
            let task = crate::hub::DownloadTask::new(repo_id.to_string(), manifest);
            self.hub.download_files(&task, &self.artifacts, |_progress| {}).await?;
        }

        self.evict_lru_if_at_capacity(entry.backend_kind).await;

        let engine_dir = adapter.ensure_installed(&self.install_root).await?;
        let (repo_id, variant) = entry.repo_and_variant();
        let artifact_path = self
            .artifacts
            .resolve(repo_id, variant, entry.backend_kind)
            .ok_or_else(|| CoreError::BackendLoadFailed {
                message: format!("no resolvable artifact for {name} after download"),
            })?;

        let port = self.supervisor.allocate_port();
        let plan = adapter.launch_plan(&engine_dir, &artifact_path, entry, port, &options)?;

        tokio::time::timeout(LOAD_READY_DEADLINE, self.supervisor.spawn_and_wait_ready(plan))
            .await
            .map_err(|_| CoreError::BackendLoadFailed {
                message: format!("{name} did not become ready within {LOAD_READY_DEADLINE:?}"),
            })?
    }

    async fn evict_lru_if_at_capacity(&self, kind: BackendKind) {
        let capacity = kind.default_capacity();
        let mut slots = self.slots.write().await;
        let same_kind: Vec<String> = slots
            .iter()
            .filter(|(_, s)| s.recipe == kind && matches!(s.state, SlotState::Ready(_)))
            .map(|(name, _)| name.clone())
            .collect();

        if same_kind.len() < capacity {
            return;
        }

        let Some(lru_name) = same_kind
            .into_iter()
            .min_by_key(|name| slots.get(name).map(|s| s.last_used).unwrap())
        else {
            return;
        };
        let Some(slot) = slots.remove(&lru_name) else { return };
        drop(slots);

        // `same_kind` only contains names whose state was `Ready` under the write
        // lock just released; nothing else can have changed it in between.
        if let SlotState::Ready(mut backend) = slot.state {
            self.wait_drained(&lru_name).await;
            let _ = self.supervisor.shutdown(&mut backend).await;
        }
    }

    /// §4.F `unload`. Empty `name` unloads every backend, oldest-`last_used` first.
    pub async fn unload(&self, name: Option<&str>) -> Result<(), CoreError> {
        match name {
            Some(name) => self.unload_one(name).await,
            None => {
                let names: Vec<String> = {
                    let mut slots: Vec<(String, Instant)> = self
                        .slots
                        .read()
                        .await
                        .iter()
                        .map(|(n, s)| (n.clone(), s.last_used))
                        .collect();
                    slots.sort_by_key(|(_, t)| *t);
                    slots.into_iter().map(|(n, _)| n).collect()
                };
                for name in names {
                    self.unload_one(&name).await?;
                }
                Ok(())
            }
        }
    }

    async fn unload_one(&self, name: &str) -> Result<(), CoreError> {
        self.wait_drained(name).await;
        let slot = self.slots.write().await.remove(name);
        match slot {
            Some(Slot { state: SlotState::Ready(mut backend), .. }) => {
                self.supervisor.shutdown(&mut backend).await
            }
            Some(_) => Ok(()),
            None => Err(CoreError::NotFound(format!("{name} is not loaded"))),
        }
    }

    async fn wait_drained(&self, name: &str) {
        self.in_flight.wait_drained(name).await;
    }

    fn op_path(op: Capability) -> &'static str {
        match op {
            Capability::Chat => "/chat/completions",
            Capability::Completion => "/completions",
            Capability::Responses => "/responses",
            Capability::Embeddings => "/embeddings",
            Capability::Reranking => "/rerank",
            Capability::Image => "/images/generations",
            Capability::AudioTranscription => "/audio/transcriptions",
            Capability::AudioSpeech => "/audio/speech",
        }
    }

    /// §4.D "the operation path is rewritten" clause: FLM and whisper don't speak the
    /// OpenAI-shaped route for their one capability, so the usual
    /// `route_prefix` + [`op_path`] composition is overridden for those two cases.
    fn southbound_path(kind: BackendKind, op: Capability, route_prefix: &str) -> String {
        match (kind, op) {
            (BackendKind::Flm, Capability::Chat) => "/api/chat".to_string(),
            (BackendKind::Whisper, Capability::AudioTranscription) => "/api/transcribe".to_string(),
            _ => format!("{route_prefix}{}", Self::op_path(op)),
        }
    }

    /// §4.D "Per-kind request rewrites": the `model` field is replaced with the
    /// child's own identifier (here, uniformly the entry's checkpoint — the same
    /// string spec names for vllm, and the only stable identifier a loaded
    /// llamacpp/oga/etc. child would otherwise echo back unchanged), and an
    /// `enable_thinking=false` flag is translated into the `/no_think` directive
    /// llama.cpp-family servers recognize by prepending it to the last user turn.
    fn rewrite_request_body(entry: &ModelEntry, mut body: serde_json::Value) -> serde_json::Value {
        let Some(obj) = body.as_object_mut() else {
            return body;
        };

        obj.insert("model".to_string(), serde_json::Value::String(entry.checkpoint.clone()));

        let wants_no_think = obj
            .get("enable_thinking")
            .and_then(|v| v.as_bool())
            .is_some_and(|enabled| !enabled);
        if wants_no_think {
            if let Some(messages) = obj.get_mut("messages").and_then(|m| m.as_array_mut()) {
                let last_user = messages
                    .iter_mut()
                    .rev()
                    .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"));
                if let Some(last_user) = last_user {
                    if let Some(serde_json::Value::String(content)) = last_user.get_mut("content") {
                        *content = format!("/no_think\n{content}");
                    }
                }
            }
        }

        body
    }

    fn require_capability(entry: &ModelEntry, op: Capability) -> Result<(), CoreError> {
        if op == Capability::Responses && !entry.backend_kind.is_oga_family() {
            return Err(CoreError::UnsupportedRecipe);
        }
        if !entry.capabilities().contains(&op) {
            return Err(CoreError::UnsupportedOperation(format!(
                "{} does not support {op}",
                entry.name
            )));
        }
        Ok(())
    }

    /// §4.F `forward`. Buffered request/response.
    pub async fn forward(
        &self,
        op: Capability,
        name: &str,
        request_json: serde_json::Value,
    ) -> Result<serde_json::Value, CoreError> {
        let entry = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
        Self::require_capability(&entry, op)?;

        self.in_flight.enter(name).await;
        let result = self.forward_inner(op, name, &entry, request_json).await;
        self.in_flight.leave(name).await;
        let response = result?;

        self.telemetry.record_from_response(&response);
        Ok(response)
    }

    async fn forward_inner(
        &self,
        op: Capability,
        name: &str,
        entry: &ModelEntry,
        request_json: serde_json::Value,
    ) -> Result<serde_json::Value, CoreError> {
        let (host_base, route_prefix) = {
            let slots = self.slots.read().await;
            match slots.get(name).map(|s| &s.state) {
                Some(SlotState::Ready(backend)) => (backend.base_url(), backend.route_prefix),
                _ => return Err(CoreError::NotFound(format!("{name} is not loaded"))),
            }
        };

        let path = Self::southbound_path(entry.backend_kind, op, route_prefix);
        let body = Self::rewrite_request_body(entry, request_json);
        let url = format!("{host_base}{path}");
        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(CoreError::BackendError { status, message });
        }
        resp.json().await.map_err(CoreError::from)
    }

    /// Buffered request/response for operations whose southbound reply isn't JSON,
    /// e.g. kokoro's raw audio bytes for `/audio/speech` (§4.G). Returns the bytes
    /// alongside the child-reported `Content-Type`, if any.
    pub async fn forward_bytes(
        &self,
        op: Capability,
        name: &str,
        request_json: serde_json::Value,
    ) -> Result<(Bytes, Option<String>), CoreError> {
        let entry = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
        Self::require_capability(&entry, op)?;

        self.in_flight.enter(name).await;
        let result = self.forward_bytes_inner(op, name, &entry, request_json).await;
        self.in_flight.leave(name).await;
        result
    }

    async fn forward_bytes_inner(
        &self,
        op: Capability,
        name: &str,
        entry: &ModelEntry,
        request_json: serde_json::Value,
    ) -> Result<(Bytes, Option<String>), CoreError> {
        let (host_base, route_prefix) = {
            let slots = self.slots.read().await;
            match slots.get(name).map(|s| &s.state) {
                Some(SlotState::Ready(backend)) => (backend.base_url(), backend.route_prefix),
                _ => return Err(CoreError::NotFound(format!("{name} is not loaded"))),
            }
        };

        let path = Self::southbound_path(entry.backend_kind, op, route_prefix);
        let body = Self::rewrite_request_body(entry, request_json);
        let url = format!("{host_base}{path}");
        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(CoreError::BackendError { status, message });
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await?;
        Ok((bytes, content_type))
    }

    /// §4.F `forward_stream`. Returns a byte stream copied verbatim from the child's
    /// SSE/chunked response, alongside the child-reported `Content-Type`, if any. The
    /// caller is responsible for detecting a client disconnect and dropping the
    /// stream, which cancels the inner HTTP read.
    pub async fn forward_stream(
        &self,
        op: Capability,
        name: &str,
        request_json: serde_json::Value,
    ) -> Result<(impl Stream<Item = Result<Bytes, CoreError>>, Option<String>), CoreError> {
        let entry = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
        Self::require_capability(&entry, op)?;

        let (host_base, route_prefix) = {
            let slots = self.slots.read().await;
            match slots.get(name).map(|s| &s.state) {
                Some(SlotState::Ready(backend)) => (backend.base_url(), backend.route_prefix),
                _ => return Err(CoreError::NotFound(format!("{name} is not loaded"))),
            }
        };

        self.in_flight.enter(name).await;
        let path = Self::southbound_path(entry.backend_kind, op, route_prefix);
        let body = Self::rewrite_request_body(&entry, request_json);
        let url = format!("{host_base}{path}");
        let resp = self.client.post(&url).json(&body).send().await;
        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                self.in_flight.leave(name).await;
                return Err(CoreError::from(e));
            }
        };
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            self.in_flight.leave(name).await;
            return Err(CoreError::BackendError { status, message });
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        use futures::StreamExt;
        let name = name.to_string();
        let stream = resp.bytes_stream().map(move |chunk| chunk.map_err(CoreError::from));
        let stream = FinishOnDrop {
            inner: stream,
            name,
            tracker: self.in_flight.clone(),
            telemetry: self.telemetry.clone(),
            last_usage: None,
        };
        Ok((stream, content_type))
    }

    pub async fn get_stats(&self) -> serde_json::Value {
        let loaded = self.all_loaded().await;
        serde_json::json!({
            "loaded": loaded.iter().map(|l| serde_json::json!({
                "model_name": l.model_name,
                "checkpoint": l.checkpoint,
                "recipe": l.recipe.to_string(),
            })).collect::<Vec<_>>(),
            "rolling": self.telemetry.snapshot(),
        })
    }
}

/// Wraps a child's byte stream so dropping it (client disconnect, or normal
/// completion) decrements the in-flight counter a concurrent `unload` may be
/// waiting on, without the stream needing to hold a full `Arc<Router>`. Also
/// watches each chunk for a trailing `usage`/`timings` object so streamed
/// requests fold into the same rolling telemetry buffered ones do (§4.H).
struct FinishOnDrop<S> {
    inner: S,
    name: String,
    tracker: InFlightTracker,
    telemetry: Arc<Telemetry>,
    last_usage: Option<serde_json::Value>,
}

impl<S: Stream<Item = Result<Bytes, CoreError>> + Unpin> Stream for FinishOnDrop<S> {
    type Item = Result<Bytes, CoreError>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let next = std::pin::Pin::new(&mut this.inner).poll_next(cx);
        if let std::task::Poll::Ready(Some(Ok(chunk))) = &next {
            if let Some(usage) = extract_usage_chunk(chunk) {
                this.last_usage = Some(usage);
            }
        }
        next
    }
}

impl<S> Drop for FinishOnDrop<S> {
    fn drop(&mut self) {
        if let Some(usage) = self.last_usage.take() {
            self.telemetry.record_from_response(&usage);
        }
        let tracker = self.tracker.clone();
        let name = self.name.clone();
        tokio::spawn(async move { tracker.leave(&name).await });
    }
}

/// Scans an SSE chunk's `data: {...}` lines for the last JSON object carrying a
/// `usage` or `timings` field, per §4.H's "final usage chunk is captured and
/// merged" rule. Best-effort: a chunk that splits a JSON object across the
/// read boundary is silently skipped rather than buffered and reassembled.
fn extract_usage_chunk(chunk: &[u8]) -> Option<serde_json::Value> {
    let text = String::from_utf8_lossy(chunk);
    let mut found = None;
    for line in text.lines() {
        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) {
            if value.get("usage").is_some() || value.get("timings").is_some() {
                found = Some(value);
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_path_maps_every_capability() {
        assert_eq!(Router::op_path(Capability::Chat), "/chat/completions");
        assert_eq!(Router::op_path(Capability::AudioSpeech), "/audio/speech");
    }
}
