//! Per-backend-kind behavior: install location, launch arguments, readiness probe,
//! and request forwarding shape.
//!
//! Grounded on the teacher's `windows_download_spec` dispatch table (`slab-server/src/
//! routes/admin/backend.rs`), which maps a backend kind to install/launch metadata
//! through a flat match rather than a class hierarchy. Re-architected away from the
//! teacher's dylib-adapter hierarchy (`slab-core/src/engine/ggml/llama/adapter.rs`)
//! since backends here are child OS processes speaking HTTP, not in-process engines.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::CoreError;
use crate::model::{BackendKind, Capability, ModelEntry};

/// Options accepted by a backend's `prepare`/`load` step. Only fields relevant to the
/// model's `backend_kind` are consulted; everything else is ignored (§4.D).
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub ctx_size: Option<u32>,
    pub gpu_layers: Option<u32>,
    pub oga_variant: Option<crate::model::OgaVariant>,
    pub extra_args: Vec<String>,
}

/// Everything the supervisor needs to spawn and probe one backend process.
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub port: u16,
    pub ready_path: &'static str,
    /// Route the inbound request path is rewritten to before being forwarded
    /// southbound, e.g. `/chat/completions` -> `/v1/chat/completions`.
    pub route_prefix: &'static str,
}

/// Per-kind behavior. One implementation per [`BackendKind`] variant; the router holds
/// these behind `Arc<dyn BackendAdapter>` rather than a global registry.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Capabilities this adapter can serve for `entry`, independent of labels.
    fn capabilities(&self, entry: &ModelEntry) -> Vec<Capability>;

    /// Resolve the install directory for this backend's engine binary, installing it
    /// via `lemonade-fetch` if it is not already present.
    async fn ensure_installed(&self, install_root: &Path) -> Result<PathBuf, CoreError>;

    /// Build the command line to launch the engine against an already-resolved
    /// artifact path, listening on `port`.
    fn launch_plan(
        &self,
        engine_dir: &Path,
        artifact_path: &Path,
        entry: &ModelEntry,
        port: u16,
        options: &LoadOptions,
    ) -> Result<LaunchPlan, CoreError>;
}

pub struct LlamacppAdapter {
    pub repo: &'static str,
}

#[async_trait]
impl BackendAdapter for LlamacppAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Llamacpp
    }

    fn capabilities(&self, _entry: &ModelEntry) -> Vec<Capability> {
        vec![Capability::Chat, Capability::Completion]
    }

    async fn ensure_installed(&self, install_root: &Path) -> Result<PathBuf, CoreError> {
        ensure_installed_via_fetch(self.repo, install_root).await
    }

    fn launch_plan(
        &self,
        engine_dir: &Path,
        artifact_path: &Path,
        _entry: &ModelEntry,
        port: u16,
        options: &LoadOptions,
    ) -> Result<LaunchPlan, CoreError> {
        let program = engine_dir.join(server_binary_name("llama-server"));
        let mut args = vec![
            "--model".to_string(),
            artifact_path.display().to_string(),
            "--port".to_string(),
            port.to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
        ];
        if let Some(ctx) = options.ctx_size {
            args.push("--ctx-size".to_string());
            args.push(ctx.to_string());
        }
        if let Some(layers) = options.gpu_layers {
            args.push("--n-gpu-layers".to_string());
            args.push(layers.to_string());
        }
        args.extend(options.extra_args.iter().cloned());
        Ok(LaunchPlan {
            program,
            args,
            port,
            ready_path: "/health",
            route_prefix: "/v1",
        })
    }
}

pub struct OgaAdapter {
    pub repo: &'static str,
}

#[async_trait]
impl BackendAdapter for OgaAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Oga
    }

    fn capabilities(&self, _entry: &ModelEntry) -> Vec<Capability> {
        vec![Capability::Chat, Capability::Completion, Capability::Responses]
    }

    async fn ensure_installed(&self, install_root: &Path) -> Result<PathBuf, CoreError> {
        ensure_installed_via_fetch(self.repo, install_root).await
    }

    fn launch_plan(
        &self,
        engine_dir: &Path,
        artifact_path: &Path,
        _entry: &ModelEntry,
        port: u16,
        options: &LoadOptions,
    ) -> Result<LaunchPlan, CoreError> {
        let program = engine_dir.join(server_binary_name("oga-server"));
        let mut args = vec![
            "--model-dir".to_string(),
            artifact_path.display().to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        if let Some(variant) = options.oga_variant {
            args.push("--execution-provider".to_string());
            args.push(variant.to_string());
        }
        Ok(LaunchPlan {
            program,
            args,
            port,
            ready_path: "/v1/models",
            route_prefix: "/v1",
        })
    }
}

pub struct RyzenaiAdapter {
    pub repo: &'static str,
}

#[async_trait]
impl BackendAdapter for RyzenaiAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Ryzenai
    }

    fn capabilities(&self, _entry: &ModelEntry) -> Vec<Capability> {
        vec![Capability::Chat, Capability::Completion, Capability::Responses]
    }

    async fn ensure_installed(&self, install_root: &Path) -> Result<PathBuf, CoreError> {
        ensure_installed_via_fetch(self.repo, install_root).await
    }

    fn launch_plan(
        &self,
        engine_dir: &Path,
        artifact_path: &Path,
        _entry: &ModelEntry,
        port: u16,
        _options: &LoadOptions,
    ) -> Result<LaunchPlan, CoreError> {
        let program = engine_dir.join(server_binary_name("ryzenai-server"));
        let args = vec![
            "--model-dir".to_string(),
            artifact_path.display().to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        Ok(LaunchPlan {
            program,
            args,
            port,
            ready_path: "/v1/models",
            route_prefix: "/v1",
        })
    }
}

pub struct FlmAdapter {
    pub repo: &'static str,
}

#[async_trait]
impl BackendAdapter for FlmAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Flm
    }

    fn capabilities(&self, _entry: &ModelEntry) -> Vec<Capability> {
        vec![Capability::Chat]
    }

    async fn ensure_installed(&self, install_root: &Path) -> Result<PathBuf, CoreError> {
        ensure_installed_via_fetch(self.repo, install_root).await
    }

    fn launch_plan(
        &self,
        engine_dir: &Path,
        artifact_path: &Path,
        _entry: &ModelEntry,
        port: u16,
        _options: &LoadOptions,
    ) -> Result<LaunchPlan, CoreError> {
        let program = engine_dir.join(server_binary_name("flm-server"));
        let args = vec![
            "--model".to_string(),
            artifact_path.display().to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        Ok(LaunchPlan {
            program,
            args,
            port,
            ready_path: "/api/tags",
            // FLM speaks its own `/api/chat` shape, not an OpenAI-prefixed one; the
            // router rewrites the op path to `/api/chat` directly (§4.D), so this
            // prefix is never consulted for FLM's one capability.
            route_prefix: "",
        })
    }
}

pub struct VllmAdapter {
    pub repo: &'static str,
}

#[async_trait]
impl BackendAdapter for VllmAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Vllm
    }

    fn capabilities(&self, _entry: &ModelEntry) -> Vec<Capability> {
        vec![Capability::Chat, Capability::Completion]
    }

    async fn ensure_installed(&self, install_root: &Path) -> Result<PathBuf, CoreError> {
        ensure_installed_via_fetch(self.repo, install_root).await
    }

    fn launch_plan(
        &self,
        engine_dir: &Path,
        artifact_path: &Path,
        _entry: &ModelEntry,
        port: u16,
        options: &LoadOptions,
    ) -> Result<LaunchPlan, CoreError> {
        let program = engine_dir.join(server_binary_name("vllm-server"));
        let mut args = vec![
            "--model".to_string(),
            artifact_path.display().to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        args.extend(options.extra_args.iter().cloned());
        Ok(LaunchPlan {
            program,
            args,
            port,
            ready_path: "/v1/models",
            route_prefix: "/v1",
        })
    }
}

pub struct StableDiffusionAdapter {
    pub repo: &'static str,
}

#[async_trait]
impl BackendAdapter for StableDiffusionAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::StableDiffusion
    }

    fn capabilities(&self, _entry: &ModelEntry) -> Vec<Capability> {
        vec![Capability::Image]
    }

    async fn ensure_installed(&self, install_root: &Path) -> Result<PathBuf, CoreError> {
        ensure_installed_via_fetch(self.repo, install_root).await
    }

    fn launch_plan(
        &self,
        engine_dir: &Path,
        artifact_path: &Path,
        _entry: &ModelEntry,
        port: u16,
        _options: &LoadOptions,
    ) -> Result<LaunchPlan, CoreError> {
        let program = engine_dir.join(server_binary_name("sd-server"));
        let args = vec![
            "--model".to_string(),
            artifact_path.display().to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        Ok(LaunchPlan {
            program,
            args,
            port,
            ready_path: "/",
            route_prefix: "/v1",
        })
    }
}

pub struct WhisperAdapter {
    pub repo: &'static str,
}

#[async_trait]
impl BackendAdapter for WhisperAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Whisper
    }

    fn capabilities(&self, _entry: &ModelEntry) -> Vec<Capability> {
        vec![Capability::AudioTranscription]
    }

    async fn ensure_installed(&self, install_root: &Path) -> Result<PathBuf, CoreError> {
        ensure_installed_via_fetch(self.repo, install_root).await
    }

    fn launch_plan(
        &self,
        engine_dir: &Path,
        artifact_path: &Path,
        _entry: &ModelEntry,
        port: u16,
        _options: &LoadOptions,
    ) -> Result<LaunchPlan, CoreError> {
        let program = engine_dir.join(server_binary_name("whisper-server"));
        let args = vec![
            "--model".to_string(),
            artifact_path.display().to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        Ok(LaunchPlan {
            program,
            args,
            port,
            ready_path: "/",
            route_prefix: "/v1",
        })
    }
}

pub struct KokoroAdapter {
    pub repo: &'static str,
}

#[async_trait]
impl BackendAdapter for KokoroAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Kokoro
    }

    fn capabilities(&self, _entry: &ModelEntry) -> Vec<Capability> {
        vec![Capability::AudioSpeech]
    }

    async fn ensure_installed(&self, install_root: &Path) -> Result<PathBuf, CoreError> {
        ensure_installed_via_fetch(self.repo, install_root).await
    }

    fn launch_plan(
        &self,
        engine_dir: &Path,
        artifact_path: &Path,
        _entry: &ModelEntry,
        port: u16,
        _options: &LoadOptions,
    ) -> Result<LaunchPlan, CoreError> {
        let program = engine_dir.join(server_binary_name("kokoro-server"));
        let args = vec![
            "--model".to_string(),
            artifact_path.display().to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        Ok(LaunchPlan {
            program,
            args,
            port,
            ready_path: "/",
            route_prefix: "/v1",
        })
    }
}

#[cfg(target_os = "windows")]
fn server_binary_name(stem: &str) -> String {
    format!("{stem}.exe")
}

#[cfg(not(target_os = "windows"))]
fn server_binary_name(stem: &str) -> String {
    stem.to_string()
}

async fn ensure_installed_via_fetch(repo: &str, install_root: &Path) -> Result<PathBuf, CoreError> {
    let install_path = install_root.join(repo.replace('/', "_"));
    let install = lemonade_fetch::install::Install::new(repo, &install_path);
    if !install.already_installed() {
        return Err(CoreError::BackendLoadFailed {
            message: format!("engine binary for {repo} is not installed; run a `lemonade-fetch` install first"),
        });
    }
    Ok(install_path)
}

/// Build the default table of adapters, one per [`BackendKind`].
pub fn default_adapters() -> Vec<Arc<dyn BackendAdapter>> {
    vec![
        Arc::new(LlamacppAdapter { repo: "ggml-org/llama.cpp" }),
        Arc::new(OgaAdapter { repo: "microsoft/onnxruntime-genai" }),
        Arc::new(RyzenaiAdapter { repo: "amd/ryzen-ai-sw" }),
        Arc::new(FlmAdapter { repo: "foldl/chatllm.cpp" }),
        Arc::new(VllmAdapter { repo: "vllm-project/vllm" }),
        Arc::new(StableDiffusionAdapter { repo: "leejet/stable-diffusion.cpp" }),
        Arc::new(WhisperAdapter { repo: "ggml-org/whisper.cpp" }),
        Arc::new(KokoroAdapter { repo: "hexgrad/kokoro" }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;
    use std::collections::BTreeSet;

    fn entry() -> ModelEntry {
        ModelEntry {
            name: "m".into(),
            checkpoint: "owner/repo:Q4_K_M".into(),
            backend_kind: BackendKind::Llamacpp,
            mmproj: None,
            labels: BTreeSet::new(),
            source: Source::Builtin,
            suggested: false,
            downloaded: false,
            resolved_path: None,
        }
    }

    #[test]
    fn default_adapters_cover_every_kind() {
        let adapters = default_adapters();
        let kinds: std::collections::HashSet<BackendKind> =
            adapters.iter().map(|a| a.kind()).collect();
        for kind in BackendKind::ALL {
            assert!(kinds.contains(&kind), "missing adapter for {kind:?}");
        }
    }

    #[test]
    fn llamacpp_launch_plan_includes_ctx_size() {
        let adapter = LlamacppAdapter { repo: "ggml-org/llama.cpp" };
        let options = LoadOptions {
            ctx_size: Some(4096),
            ..Default::default()
        };
        let plan = adapter
            .launch_plan(Path::new("/engines/llamacpp"), Path::new("/models/m.gguf"), &entry(), 8080, &options)
            .unwrap();
        assert!(plan.args.contains(&"--ctx-size".to_string()));
        assert!(plan.args.contains(&"4096".to_string()));
        assert_eq!(plan.route_prefix, "/v1");
    }

    #[test]
    fn oga_capabilities_include_responses() {
        let adapter = OgaAdapter { repo: "microsoft/onnxruntime-genai" };
        assert!(adapter.capabilities(&entry()).contains(&Capability::Responses));
    }
}
