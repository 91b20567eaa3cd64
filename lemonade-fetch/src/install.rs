use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::downloader::Downloader;
use crate::error::FetchError;

const VERSION_FILE: &str = "version.json";

/// Version information stored in `version.json` next to an installed asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub tag_name: String,
    pub repo: String,
}

/// Tracks installation state and version for a single repository's assets.
pub struct Install {
    repo: String,
    install_path: PathBuf,
}

impl Install {
    pub fn new<P: AsRef<Path>>(repo: &str, install_path: P) -> Self {
        Self {
            repo: repo.to_string(),
            install_path: install_path.as_ref().to_path_buf(),
        }
    }

    fn version_file(&self) -> PathBuf {
        self.install_path.join(VERSION_FILE)
    }

    pub fn already_installed(&self) -> bool {
        self.version_file().exists()
    }

    pub fn get_installed_version(&self) -> Result<VersionInfo, FetchError> {
        let data = fs::read_to_string(self.version_file())?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn create_version_file(&self, version: &str) -> Result<(), FetchError> {
        fs::create_dir_all(&self.install_path)?;
        let info = VersionInfo {
            tag_name: version.to_string(),
            repo: self.repo.clone(),
        };
        fs::write(self.version_file(), serde_json::to_string(&info)?)?;
        Ok(())
    }

    /// Install `asset_name` at `version`.
    ///
    /// If `allow_upgrade` is set (the caller used `.latest()`), the already-installed
    /// tag is compared against the freshly resolved latest tag and the install is
    /// skipped when they match; otherwise the pinned tag is compared directly.
    pub async fn install_asset(
        &self,
        downloader: &Downloader,
        asset_name: &str,
        version: &str,
        allow_upgrade: bool,
    ) -> Result<PathBuf, FetchError> {
        if self.already_installed() {
            let installed = self.get_installed_version()?;

            if installed.repo != self.repo {
                return Err(FetchError::RepositoryMismatch(installed.repo));
            }

            let target_version = if allow_upgrade {
                downloader.latest_version().await?
            } else {
                version.to_string()
            };

            if installed.tag_name == target_version {
                return Ok(self.install_path.clone());
            }

            self.remove_install_dir()?;
            downloader
                .download_asset(asset_name, &target_version, &self.install_path)
                .await?;
            self.create_version_file(&target_version)?;
            return Ok(self.install_path.clone());
        }

        downloader
            .download_asset(asset_name, version, &self.install_path)
            .await?;
        self.create_version_file(version)?;
        Ok(self.install_path.clone())
    }

    fn remove_install_dir(&self) -> Result<(), FetchError> {
        if self.install_path.exists() {
            fs::remove_dir_all(&self.install_path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_read_version_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let install = Install::new("owner/repo", dir.path());
        install.create_version_file("v1.0.0").unwrap();

        let info = install.get_installed_version().unwrap();
        assert_eq!(info.tag_name, "v1.0.0");
        assert_eq!(info.repo, "owner/repo");
        assert!(install.already_installed());
    }

    #[test]
    fn not_installed_when_dir_absent() {
        let dir = tempfile::tempdir().unwrap();
        let install = Install::new("owner/repo", dir.path().join("nonexistent"));
        assert!(!install.already_installed());
    }
}
