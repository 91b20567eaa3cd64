//! Authoritative catalog mapping logical name → [`ModelEntry`].
//!
//! Grounded on the shape of `ModelStore`/`ModelCatalogRecord` in the teacher's SQLite
//! DAO layer, deliberately not reusing its storage mechanism: SPEC_FULL.md §4.C calls
//! for a single persisted JSON file, merged with an embedded builtin catalog, behind a
//! copy-on-write snapshot pointer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::CoreError;
use crate::model::{BackendKind, ModelEntry};

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub downloaded_only: bool,
    pub by_label: Option<String>,
    pub by_kind: Option<BackendKind>,
}

struct Snapshot {
    /// Builtin + user entries, keyed by name. Builtins are loaded once at startup
    /// and never change; only the user subset is ever rewritten.
    entries: HashMap<String, ModelEntry>,
}

pub struct Registry {
    user_file: PathBuf,
    builtin_names: std::collections::HashSet<String>,
    snapshot: RwLock<Arc<Snapshot>>,
    /// Serializes writers to `user_file`; reads never take this lock (§5).
    write_lock: tokio::sync::Mutex<()>,
}

impl Registry {
    /// Load the embedded builtin catalog and merge it with `user_file` if present.
    pub async fn load(user_file: impl Into<PathBuf>, builtin_json: &str) -> Result<Self, CoreError> {
        let user_file = user_file.into();
        let builtins: Vec<ModelEntry> = serde_json::from_str(builtin_json)?;
        let builtin_names = builtins.iter().map(|e| e.name.clone()).collect();

        let mut entries: HashMap<String, ModelEntry> =
            builtins.into_iter().map(|e| (e.name.clone(), e)).collect();

        if let Ok(data) = tokio::fs::read_to_string(&user_file).await {
            let user_entries: Vec<ModelEntry> = serde_json::from_str(&data).unwrap_or_default();
            for e in user_entries {
                entries.insert(e.name.clone(), e);
            }
        }

        Ok(Self {
            user_file,
            builtin_names,
            snapshot: RwLock::new(Arc::new(Snapshot { entries })),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().await.clone()
    }

    pub async fn list(&self, filter: &ListFilter) -> Vec<ModelEntry> {
        let snap = self.current().await;
        snap.entries
            .values()
            .filter(|e| !filter.downloaded_only || e.downloaded)
            .filter(|e| filter.by_label.as_ref().is_none_or(|l| e.labels.contains(l)))
            .filter(|e| filter.by_kind.is_none_or(|k| e.backend_kind == k))
            .cloned()
            .collect()
    }

    pub async fn get(&self, name: &str) -> Option<ModelEntry> {
        self.current().await.entries.get(name).cloned()
    }

    /// §4.C `register_user`.
    pub async fn register_user(&self, entry: ModelEntry) -> Result<(), CoreError> {
        if !ModelEntry::is_user_name(&entry.name) {
            return Err(CoreError::Validation(format!(
                "user model names must start with 'user.', got {:?}",
                entry.name
            )));
        }
        if self.builtin_names.contains(&entry.name) {
            return Err(CoreError::Conflict(entry.name));
        }

        let _guard = self.write_lock.lock().await;
        let current = self.current().await;
        if current.entries.contains_key(&entry.name) {
            return Err(CoreError::Conflict(entry.name));
        }

        let mut entries = current.entries.clone();
        entries.insert(entry.name.clone(), entry);
        self.publish(entries).await
    }

    /// §4.C `unregister_user`.
    pub async fn unregister_user(&self, name: &str) -> Result<(), CoreError> {
        if self.builtin_names.contains(name) {
            return Err(CoreError::Validation(format!(
                "cannot remove builtin entry {name:?}"
            )));
        }
        let _guard = self.write_lock.lock().await;
        let current = self.current().await;
        if !current.entries.contains_key(name) {
            return Err(CoreError::NotFound(name.to_string()));
        }
        let mut entries = current.entries.clone();
        entries.remove(name);
        self.publish(entries).await
    }

    pub async fn mark_downloaded(&self, name: &str, resolved_path: Option<String>) {
        self.mutate_derived(name, true, resolved_path).await;
    }

    pub async fn clear_downloaded(&self, name: &str) {
        self.mutate_derived(name, false, None).await;
    }

    async fn mutate_derived(&self, name: &str, downloaded: bool, resolved_path: Option<String>) {
        let mut snap = self.snapshot.write().await;
        let mut entries = (**snap).entries.clone();
        if let Some(e) = entries.get_mut(name) {
            e.downloaded = downloaded;
            e.resolved_path = resolved_path;
        }
        *snap = Arc::new(Snapshot { entries });
    }

    /// Persist only the user subset (builtins are never written to disk) and swap in
    /// the new snapshot pointer.
    async fn publish(&self, entries: HashMap<String, ModelEntry>) -> Result<(), CoreError> {
        let user_entries: Vec<&ModelEntry> = entries
            .values()
            .filter(|e| !self.builtin_names.contains(&e.name))
            .collect();
        let data = serde_json::to_string_pretty(&user_entries)?;
        if let Some(parent) = self.user_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.user_file.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.user_file).await?;

        let mut snap = self.snapshot.write().await;
        *snap = Arc::new(Snapshot { entries });
        Ok(())
    }

    pub fn user_file_path(&self) -> &Path {
        &self.user_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;

    const BUILTIN: &str = r#"[{"name":"Qwen3-0.6B-GGUF","checkpoint":"unsloth/Qwen3-0.6B-GGUF:Q4_K_M","backend_kind":"llamacpp","labels":["hot"],"source":"builtin"}]"#;

    fn user_entry(name: &str) -> ModelEntry {
        ModelEntry {
            name: name.to_string(),
            checkpoint: "me/mymodel".into(),
            backend_kind: BackendKind::Llamacpp,
            mmproj: None,
            labels: Default::default(),
            source: Source::UserHub,
            suggested: false,
            downloaded: false,
            resolved_path: None,
        }
    }

    #[tokio::test]
    async fn load_merges_builtin_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::load(dir.path().join("user_models.json"), BUILTIN)
            .await
            .unwrap();
        assert!(reg.get("Qwen3-0.6B-GGUF").await.is_some());
    }

    #[tokio::test]
    async fn register_user_rejects_missing_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::load(dir.path().join("user_models.json"), BUILTIN)
            .await
            .unwrap();
        let err = reg.register_user(user_entry("not-prefixed")).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn register_user_rejects_builtin_collision() {
        // A builtin named with the `user.` prefix is contrived, but it's the only way
        // to reach `register_user`'s builtin-collision branch at all: anything that
        // fails `is_user_name` is rejected by the prefix check first.
        const BUILTIN_WITH_USER_PREFIX: &str =
            r#"[{"name":"user.pinned","checkpoint":"unsloth/Qwen3-0.6B-GGUF:Q4_K_M","backend_kind":"llamacpp","labels":["hot"],"source":"builtin"}]"#;
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::load(dir.path().join("user_models.json"), BUILTIN_WITH_USER_PREFIX)
            .await
            .unwrap();
        let e = user_entry("user.pinned");
        let err = reg.register_user(e).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::load(dir.path().join("user_models.json"), BUILTIN)
            .await
            .unwrap();
        reg.register_user(user_entry("user.mine")).await.unwrap();
        let got = reg.get("user.mine").await.unwrap();
        assert_eq!(got.checkpoint, "me/mymodel");
    }

    #[tokio::test]
    async fn unregister_builtin_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::load(dir.path().join("user_models.json"), BUILTIN)
            .await
            .unwrap();
        let err = reg.unregister_user("Qwen3-0.6B-GGUF").await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn persisted_user_file_reloads_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user_models.json");
        {
            let reg = Registry::load(&path, BUILTIN).await.unwrap();
            reg.register_user(user_entry("user.mine")).await.unwrap();
        }
        let reg2 = Registry::load(&path, BUILTIN).await.unwrap();
        assert!(reg2.get("user.mine").await.is_some());
    }
}
