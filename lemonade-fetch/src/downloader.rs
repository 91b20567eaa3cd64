use crate::error::FetchError;
use flate2::read::GzDecoder;
use reqwest::Client;
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;
use tar::Archive;
use tracing::{info, warn};

pub struct Downloader {
    pub repo: String,
    pub retry_count: usize,
    pub retry_delay_secs: u64,
    pub proxy: Option<String>,
    client: Client,
}

impl Downloader {
    pub fn new(repo: &str, retry_count: usize, retry_delay_secs: u64, proxy: Option<String>) -> Self {
        let mut builder =
            Client::builder().user_agent(concat!("lemonade-fetch/", env!("CARGO_PKG_VERSION")));

        if let Some(ref proxy_url) = proxy {
            match reqwest::Proxy::all(proxy_url) {
                Ok(p) => builder = builder.proxy(p),
                Err(e) => warn!("ignoring invalid proxy URL {:?}: {}", proxy_url, e),
            }
        }

        let client = builder.build().unwrap_or_default();

        Self {
            repo: repo.to_string(),
            retry_count,
            retry_delay_secs,
            proxy,
            client,
        }
    }

    /// Fetch the latest release tag from GitHub for the configured repo.
    pub async fn latest_version(&self) -> Result<String, FetchError> {
        let api_url = format!("https://api.github.com/repos/{}/releases/latest", self.repo);

        let mut last_err = None;
        for attempt in 0..self.retry_count.max(1) {
            match self.get_latest_version_once(&api_url).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < self.retry_count {
                        tokio::time::sleep(Duration::from_secs(self.retry_delay_secs)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(FetchError::InvalidResponse {
            message: "unable to fetch latest version".to_string(),
        }))
    }

    async fn get_latest_version_once(&self, url: &str) -> Result<String, FetchError> {
        let resp = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await?
            .error_for_status()?;

        let json: serde_json::Value = resp.json().await?;
        json["tag_name"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| FetchError::InvalidResponse {
                message: "tag_name not found in GitHub API response".to_string(),
            })
    }

    /// Build the download URL for a release asset.
    pub fn asset_url(&self, asset_name: &str, version: &str) -> String {
        format!(
            "https://github.com/{}/releases/download/{}/{}",
            self.repo, version, asset_name
        )
    }

    /// Download and extract a release asset into `dest`.
    pub async fn download_asset(
        &self,
        asset_name: &str,
        version: &str,
        dest: &Path,
    ) -> Result<(), FetchError> {
        let url = self.asset_url(asset_name, version);
        info!("downloading {} from {}", asset_name, url);

        let bytes = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        std::fs::create_dir_all(dest)?;

        if asset_name.ends_with(".zip") {
            extract_zip(&bytes, dest)?;
        } else if asset_name.ends_with(".tar.gz") || asset_name.ends_with(".tgz") {
            extract_tar_gz_strip_top(&bytes, dest)?;
        } else {
            std::fs::write(dest.join(asset_name), &bytes)?;
        }

        info!("{} installed into {}", asset_name, dest.display());
        Ok(())
    }
}

/// Extract a ZIP archive into `dest`, stripping the top-level directory.
pub(crate) fn extract_zip(bytes: &[u8], dest: &Path) -> Result<(), FetchError> {
    let cursor = Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor)?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let file_path = match file.enclosed_name() {
            Some(p) => p,
            None => continue,
        };

        let components: Vec<_> = file_path.components().collect();
        if components.len() <= 1 {
            continue;
        }
        let rel_path: std::path::PathBuf = components.iter().skip(1).collect();
        let dest_path = dest.join(rel_path);

        if file.is_dir() {
            std::fs::create_dir_all(&dest_path)?;
        } else {
            if let Some(parent) = dest_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(&dest_path)?;
            std::io::copy(&mut file, &mut out)?;
        }
    }

    Ok(())
}

/// Extract a `.tar.gz` archive into `dest`, stripping the top-level directory.
pub(crate) fn extract_tar_gz_strip_top(bytes: &[u8], dest: &Path) -> Result<(), FetchError> {
    let tar_gz = GzDecoder::new(Cursor::new(bytes));
    let mut archive = Archive::new(tar_gz);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let full_path = entry.path()?.to_path_buf();
        let components: Vec<_> = full_path.components().collect();
        if components.len() <= 1 {
            continue;
        }
        let rel_path: std::path::PathBuf = components.iter().skip(1).collect();
        let dest_path = dest.join(rel_path);
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(dest_path)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_url_matches_github_release_convention() {
        let d = Downloader::new("ggml-org/llama.cpp", 3, 3, None);
        assert_eq!(
            d.asset_url("llama-b1-bin-win-cpu-x64.zip", "b1"),
            "https://github.com/ggml-org/llama.cpp/releases/download/b1/llama-b1-bin-win-cpu-x64.zip"
        );
    }

    #[test]
    fn extract_tar_gz_strips_top_level_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut tar_buf = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_buf);
            let data = b"hello";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "top/inner/file.txt", &data[..])
                .unwrap();
            builder.finish().unwrap();
        }
        let mut gz_buf = Vec::new();
        {
            let mut encoder =
                flate2::write::GzEncoder::new(&mut gz_buf, flate2::Compression::default());
            std::io::Write::write_all(&mut encoder, &tar_buf).unwrap();
            encoder.finish().unwrap();
        }
        extract_tar_gz_strip_top(&gz_buf, dir.path()).unwrap();
        let content = std::fs::read_to_string(dir.path().join("inner/file.txt")).unwrap();
        assert_eq!(content, "hello");
    }
}
