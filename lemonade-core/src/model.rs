use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strum::{Display, EnumString};

/// The family of inference engine a [`ModelEntry`] is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Llamacpp,
    Oga,
    Flm,
    Vllm,
    StableDiffusion,
    Whisper,
    Kokoro,
    Ryzenai,
}

impl BackendKind {
    /// All kinds, in the order the default capacity table is documented.
    pub const ALL: [BackendKind; 8] = [
        BackendKind::Llamacpp,
        BackendKind::Oga,
        BackendKind::Flm,
        BackendKind::Vllm,
        BackendKind::StableDiffusion,
        BackendKind::Whisper,
        BackendKind::Kokoro,
        BackendKind::Ryzenai,
    ];

    /// Default per-kind concurrent-load capacity (§3 Capacity policy).
    pub fn default_capacity(self) -> usize {
        1
    }

    /// Whether this kind is part of the "OGA family" that gates `/responses`.
    pub fn is_oga_family(self) -> bool {
        matches!(self, BackendKind::Oga | BackendKind::Ryzenai)
    }
}

/// Execution-provider sub-variant recognized by the `oga` kind's `prepare` options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OgaVariant {
    Cpu,
    Hybrid,
    Npu,
}

/// An inference operation an adapter can serve for a loaded backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Completion,
    Responses,
    Embeddings,
    Reranking,
    Image,
    AudioTranscription,
    AudioSpeech,
}

/// Where a [`ModelEntry`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Builtin,
    UserHub,
    UserUpload,
    UserPath,
}

/// Catalog row: logical name → checkpoint, backend kind, and descriptive labels.
///
/// `downloaded` and `resolved_path` are derived at lookup time by consulting the
/// artifact store; they are never persisted in `user_models.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub checkpoint: String,
    pub backend_kind: BackendKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmproj: Option<String>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    pub source: Source,
    #[serde(default)]
    pub suggested: bool,
    #[serde(default, skip_serializing)]
    pub downloaded: bool,
    #[serde(default, skip_serializing)]
    pub resolved_path: Option<String>,
}

/// Labels with load-bearing behavior; every other label (`hot`, `coding`, `hybrid`,
/// `suggested`) is carried as an opaque string with no effect on routing.
/// Decision recorded in SPEC_FULL.md §11 (Open Question 2).
pub const FUNCTIONAL_LABELS: [&str; 4] = ["embeddings", "reranking", "vision", "reasoning"];

impl ModelEntry {
    /// Split `checkpoint` into `(repo_id, variant)`, where `variant` is the text
    /// after a trailing `:`, if any (e.g. `"unsloth/Qwen3-0.6B-GGUF:Q4_K_M"`).
    pub fn repo_and_variant(&self) -> (&str, Option<&str>) {
        match self.checkpoint.split_once(':') {
            Some((repo, variant)) => (repo, Some(variant)),
            None => (self.checkpoint.as_str(), None),
        }
    }

    /// The capability set this entry's backend kind supports, narrowed by labels
    /// per the functional-label decision above.
    pub fn capabilities(&self) -> BTreeSet<Capability> {
        let mut caps = BTreeSet::new();
        match self.backend_kind {
            BackendKind::Llamacpp | BackendKind::Vllm | BackendKind::Oga | BackendKind::Ryzenai => {
                caps.insert(Capability::Chat);
                caps.insert(Capability::Completion);
                if self.backend_kind.is_oga_family() {
                    caps.insert(Capability::Responses);
                }
            }
            BackendKind::Flm => {
                caps.insert(Capability::Chat);
            }
            BackendKind::StableDiffusion => {
                caps.insert(Capability::Image);
            }
            BackendKind::Whisper => {
                caps.insert(Capability::AudioTranscription);
            }
            BackendKind::Kokoro => {
                caps.insert(Capability::AudioSpeech);
            }
        }
        if self.labels.contains("embeddings") {
            caps.insert(Capability::Embeddings);
        }
        if self.labels.contains("reranking") {
            caps.insert(Capability::Reranking);
        }
        caps
    }

    /// §3 invariant: `user.*` names are the only writable subset.
    pub fn is_user_name(name: &str) -> bool {
        name.starts_with("user.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: BackendKind, labels: &[&str]) -> ModelEntry {
        ModelEntry {
            name: "m".into(),
            checkpoint: "owner/repo:Q4_K_M".into(),
            backend_kind: kind,
            mmproj: None,
            labels: labels.iter().map(|s| s.to_string()).collect(),
            source: Source::Builtin,
            suggested: false,
            downloaded: false,
            resolved_path: None,
        }
    }

    #[test]
    fn repo_and_variant_splits_on_colon() {
        let e = entry(BackendKind::Llamacpp, &[]);
        assert_eq!(e.repo_and_variant(), ("owner/repo", Some("Q4_K_M")));
    }

    #[test]
    fn repo_and_variant_no_colon() {
        let mut e = entry(BackendKind::Llamacpp, &[]);
        e.checkpoint = "owner/repo".into();
        assert_eq!(e.repo_and_variant(), ("owner/repo", None));
    }

    #[test]
    fn llamacpp_has_chat_and_completion() {
        let e = entry(BackendKind::Llamacpp, &[]);
        let caps = e.capabilities();
        assert!(caps.contains(&Capability::Chat));
        assert!(caps.contains(&Capability::Completion));
        assert!(!caps.contains(&Capability::Responses));
    }

    #[test]
    fn oga_has_responses() {
        let e = entry(BackendKind::Oga, &[]);
        assert!(e.capabilities().contains(&Capability::Responses));
    }

    #[test]
    fn embeddings_label_is_functional() {
        let e = entry(BackendKind::Llamacpp, &["embeddings", "hot"]);
        let caps = e.capabilities();
        assert!(caps.contains(&Capability::Embeddings));
    }

    #[test]
    fn user_name_prefix_check() {
        assert!(ModelEntry::is_user_name("user.my-model"));
        assert!(!ModelEntry::is_user_name("Qwen3-0.6B-GGUF"));
    }
}
