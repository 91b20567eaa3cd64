//! On-disk cache of model files: layout, atomic writes, and reverse lookup.
//!
//! Grounded on the cache-directory convention `hf-hub` already uses elsewhere in this
//! workspace (`models--<owner>--<repo>/snapshots/<revision>/…`), reimplemented here so
//! writes can be streamed, resumed, and cancelled — properties the synchronous `hf-hub`
//! API does not expose.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::CoreError;
use crate::model::BackendKind;

/// Encode a hub repo id (`"owner/name"`) into its cache directory name.
pub fn encode_repo_dir(repo_id: &str) -> String {
    format!("models--{}", repo_id.replace('/', "--"))
}

pub struct ArtifactStore {
    root: PathBuf,
    /// One lock per `(repo_id, relpath)` in flight, so concurrent writers to the same
    /// path are serialized rather than corrupting each other's temp file.
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo_dir(&self, repo_id: &str) -> PathBuf {
        self.root.join(encode_repo_dir(repo_id))
    }

    fn snapshot_dir(&self, repo_id: &str, revision: &str) -> PathBuf {
        self.repo_dir(repo_id).join("snapshots").join(revision)
    }

    /// §4.A `resolve`: for `llamacpp`, find a `*.gguf` file across all snapshots,
    /// excluding anything containing `mmproj`, optionally filtered by `variant`
    /// (case-insensitive substring match). For OGA-family, find the directory
    /// containing `genai_config.json`.
    pub fn resolve(
        &self,
        repo_id: &str,
        variant: Option<&str>,
        kind: BackendKind,
    ) -> Option<PathBuf> {
        let snapshots_dir = self.repo_dir(repo_id).join("snapshots");
        let entries = std::fs::read_dir(&snapshots_dir).ok()?;

        let mut candidates: Vec<PathBuf> = Vec::new();
        for snapshot in entries.flatten() {
            let snapshot_path = snapshot.path();
            if !snapshot_path.is_dir() {
                continue;
            }
            if kind.is_oga_family() || matches!(kind, BackendKind::Oga) {
                let config = snapshot_path.join("genai_config.json");
                if config.is_file() {
                    candidates.push(snapshot_path.clone());
                }
                continue;
            }
            if matches!(kind, BackendKind::Llamacpp) {
                if let Ok(files) = std::fs::read_dir(&snapshot_path) {
                    for f in files.flatten() {
                        let name = f.file_name();
                        let name = name.to_string_lossy();
                        if !name.ends_with(".gguf") || name.to_lowercase().contains("mmproj") {
                            continue;
                        }
                        if let Some(v) = variant {
                            if !name.to_lowercase().contains(&v.to_lowercase()) {
                                continue;
                            }
                        }
                        candidates.push(f.path());
                    }
                }
            }
        }
        candidates.into_iter().next()
    }

    /// Whether at least one snapshot exists locally for `repo_id`.
    pub fn has_any_snapshot(&self, repo_id: &str) -> bool {
        self.repo_dir(repo_id)
            .join("snapshots")
            .read_dir()
            .map(|mut d| d.next().is_some())
            .unwrap_or(false)
    }

    async fn lock_for(&self, repo_id: &str, relpath: &str) -> Arc<Mutex<()>> {
        let key = format!("{repo_id}::{relpath}");
        let mut locks = self.write_locks.lock().await;
        locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Open an atomic writer for one file of a download: writes go to a sibling
    /// `.part` file and are renamed into place on `finish()`.
    pub async fn open_writer(
        &self,
        repo_id: &str,
        revision: &str,
        relpath: &str,
    ) -> Result<ArtifactWriter, CoreError> {
        let lock = self.lock_for(repo_id, relpath).await;
        let final_path = self.snapshot_dir(repo_id, revision).join(relpath);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = final_path.with_extension(format!(
            "{}.part",
            final_path.extension().and_then(|e| e.to_str()).unwrap_or("")
        ));
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&tmp_path)
            .await?;
        let bytes_so_far = file.metadata().await?.len();
        Ok(ArtifactWriter {
            _lock: lock,
            file,
            tmp_path,
            final_path,
            bytes_written: bytes_so_far,
        })
    }

    /// §4.A `delete`: recursively remove a repo's cache directory.
    pub fn delete(&self, repo_id: &str) -> Result<(), CoreError> {
        let dir = self.repo_dir(repo_id);
        if !dir.exists() {
            return Ok(());
        }
        std::fs::remove_dir_all(&dir).map_err(|e| {
            if is_file_in_use(&e) {
                CoreError::InUse(format!("{repo_id}: {e}"))
            } else {
                CoreError::from(e)
            }
        })
    }
}

fn is_file_in_use(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(32) | Some(33) // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION on Windows
    ) || e.kind() == std::io::ErrorKind::WouldBlock
}

/// A handle for one file download, supporting resumed writes.
pub struct ArtifactWriter {
    _lock: Arc<Mutex<()>>,
    file: tokio::fs::File,
    tmp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
}

impl ArtifactWriter {
    /// Bytes already present in the temp file, for resume via a ranged request.
    pub fn resume_offset(&self) -> u64 {
        self.bytes_written
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), CoreError> {
        self.file.write_all(chunk).await?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    /// Atomically publish the downloaded file.
    pub async fn finish(self) -> Result<(), CoreError> {
        self.file.sync_all().await.ok();
        drop(self.file);
        tokio::fs::rename(&self.tmp_path, &self.final_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_repo_dir_replaces_slash() {
        assert_eq!(
            encode_repo_dir("unsloth/Qwen3-0.6B-GGUF"),
            "models--unsloth--Qwen3-0.6B-GGUF"
        );
    }

    #[tokio::test]
    async fn open_writer_then_finish_publishes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let mut w = store
            .open_writer("owner/repo", "main", "model.gguf")
            .await
            .unwrap();
        w.write_chunk(b"hello").await.unwrap();
        w.write_chunk(b" world").await.unwrap();
        w.finish().await.unwrap();

        let published = dir
            .path()
            .join("models--owner--repo")
            .join("snapshots")
            .join("main")
            .join("model.gguf");
        let content = tokio::fs::read_to_string(&published).await.unwrap();
        assert_eq!(content, "hello world");
    }

    #[tokio::test]
    async fn resolve_finds_gguf_excluding_mmproj() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let snap = dir
            .path()
            .join("models--owner--repo")
            .join("snapshots")
            .join("main");
        tokio::fs::create_dir_all(&snap).await.unwrap();
        tokio::fs::write(snap.join("mmproj-f16.gguf"), b"x").await.unwrap();
        tokio::fs::write(snap.join("model-Q4_K_M.gguf"), b"x").await.unwrap();

        let resolved = store.resolve("owner/repo", None, BackendKind::Llamacpp);
        assert_eq!(resolved.unwrap().file_name().unwrap(), "model-Q4_K_M.gguf");
    }

    #[tokio::test]
    async fn resolve_filters_by_variant_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let snap = dir
            .path()
            .join("models--owner--repo")
            .join("snapshots")
            .join("main");
        tokio::fs::create_dir_all(&snap).await.unwrap();
        tokio::fs::write(snap.join("model-q8_0.gguf"), b"x").await.unwrap();

        assert!(store
            .resolve("owner/repo", Some("Q8_0"), BackendKind::Llamacpp)
            .is_some());
        assert!(store
            .resolve("owner/repo", Some("Q4_K_M"), BackendKind::Llamacpp)
            .is_none());
    }

    #[test]
    fn delete_nonexistent_repo_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(store.delete("owner/repo").is_ok());
    }
}
