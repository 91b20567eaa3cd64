use std::env;

use crate::downloader::Downloader;
use crate::error::FetchError;
use crate::install::{Install, VersionInfo};

/// Top-level builder for installing a backend adapter's child binary from a
/// GitHub release.
///
/// # Example
/// ```rust,no_run
/// # tokio_test::block_on(async {
/// use lemonade_fetch::Api;
/// Api::new()
///     .set_install_dir("./backends/llamacpp")
///     .repo("ggml-org/llama.cpp")
///     .latest()
///     .install(|v| format!("llama-{v}-bin-win-cpu-x64.zip"))
///     .await
///     .unwrap();
/// # })
/// ```
pub struct Api {
    pub(crate) install_dir: String,
    pub(crate) retry_count: usize,
    pub(crate) retry_delay_secs: u64,
    pub(crate) proxy: Option<String>,
}

/// Builder stage after `.repo()` has been called.
pub struct RepoApi {
    api: Api,
    repo: String,
}

/// Builder stage after `.latest()` or `.version()` has been called.
pub struct VersionApi {
    api: Api,
    repo: String,
    version: String,
    is_latest: bool,
}

impl Default for Api {
    fn default() -> Self {
        Self::new()
    }
}

impl Api {
    /// Proxy is automatically read from `HTTP_PROXY` / `HTTPS_PROXY`.
    pub fn new() -> Self {
        let proxy = env::var("HTTP_PROXY")
            .ok()
            .or_else(|| env::var("HTTPS_PROXY").ok());

        Self {
            install_dir: ".".to_string(),
            retry_count: 3,
            retry_delay_secs: 3,
            proxy,
        }
    }

    pub fn set_install_dir(mut self, dir: impl Into<String>) -> Self {
        self.install_dir = dir.into();
        self
    }

    pub fn set_retry_count(mut self, count: usize) -> Self {
        self.retry_count = count;
        self
    }

    pub fn set_retry_delay_secs(mut self, secs: u64) -> Self {
        self.retry_delay_secs = secs;
        self
    }

    pub fn set_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Specify the GitHub repository (`"owner/repo"`).
    pub fn repo(self, repo: impl Into<String>) -> RepoApi {
        RepoApi {
            api: self,
            repo: repo.into(),
        }
    }
}

impl RepoApi {
    /// Target the latest release; re-resolved (and re-installed if newer) on every call.
    pub fn latest(self) -> VersionApi {
        VersionApi {
            api: self.api,
            repo: self.repo,
            version: String::new(),
            is_latest: true,
        }
    }

    /// Target a specific release tag (e.g. `"b4523"`).
    pub fn version(self, version: impl Into<String>) -> VersionApi {
        VersionApi {
            api: self.api,
            repo: self.repo,
            version: version.into(),
            is_latest: false,
        }
    }

    pub fn get_installed_version(&self) -> Result<VersionInfo, FetchError> {
        Install::new(&self.repo, &self.api.install_dir).get_installed_version()
    }
}

impl VersionApi {
    /// Download and extract the release asset produced by `asset_func(version)`.
    ///
    /// Idempotent: a second call at the same resolved version is a no-op.
    pub async fn install<F>(self, asset_func: F) -> Result<std::path::PathBuf, FetchError>
    where
        F: Fn(&str) -> String,
    {
        let downloader = Downloader::new(
            &self.repo,
            self.api.retry_count,
            self.api.retry_delay_secs,
            self.api.proxy.clone(),
        );

        let version = if self.is_latest {
            downloader.latest_version().await?
        } else {
            self.version.clone()
        };

        let asset_name = asset_func(&version);
        let install = Install::new(&self.repo, &self.api.install_dir);
        install
            .install_asset(&downloader, &asset_name, &version, self.is_latest)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_defaults() {
        let api = Api::new();
        assert_eq!(api.install_dir, ".");
        assert_eq!(api.retry_count, 3);
        assert_eq!(api.retry_delay_secs, 3);
    }

    #[test]
    fn builder_methods_set_fields() {
        let api = Api::new()
            .set_install_dir("./mydir")
            .set_retry_count(5)
            .set_retry_delay_secs(10)
            .set_proxy("http://proxy:8080");

        assert_eq!(api.install_dir, "./mydir");
        assert_eq!(api.retry_count, 5);
        assert_eq!(api.retry_delay_secs, 10);
        assert_eq!(api.proxy, Some("http://proxy:8080".to_string()));
    }

    #[test]
    fn repo_returns_repo_api() {
        let repo_api = Api::new().repo("owner/repo");
        assert_eq!(repo_api.repo, "owner/repo");
    }

    #[test]
    fn latest_sets_is_latest() {
        let ver = Api::new().repo("owner/repo").latest();
        assert!(ver.is_latest);
        assert!(ver.version.is_empty());
    }

    #[test]
    fn version_sets_tag() {
        let ver = Api::new().repo("owner/repo").version("b4523");
        assert!(!ver.is_latest);
        assert_eq!(ver.version, "b4523");
    }
}
