//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;

/// Runtime configuration for the gateway, assembled from `LEMONADE_*` env vars and
/// CLI overrides at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host to bind (default `127.0.0.1`).
    pub host: String,
    /// Port to bind (default `8000`).
    pub port: u16,
    /// Artifact cache root (default platform cache dir / `lemonade`).
    pub cache_dir: PathBuf,
    /// When set, never touch the network; only locally cached artifacts resolve.
    pub offline: bool,
    /// Default backend kind name used when a request omits `llamacpp_backend`.
    pub llamacpp_backend: String,
    /// Bearer token sent to the hub on downloads, if any.
    pub hf_token: Option<String>,
    /// Disables caches/hardware probes; used by CI runs.
    pub ci_mode: bool,
    /// `tracing` filter string, e.g. `"info"` or `"lemonade_server=debug,tower_http=warn"`.
    pub log_level: String,
    /// First port handed out to backend children; increments per spawn.
    pub backend_port_range_start: u16,
    /// Context size applied to a `load` that doesn't specify one.
    pub default_ctx_size: u32,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let cache_dir = env_or(
            "LEMONADE_CACHE_DIR",
            &default_cache_dir().to_string_lossy(),
        );
        Self {
            host: env_or("LEMONADE_HOST", "127.0.0.1"),
            port: parse_env("LEMONADE_PORT", 8000),
            cache_dir: PathBuf::from(cache_dir),
            offline: bool_env("LEMONADE_OFFLINE", false),
            llamacpp_backend: env_or("LEMONADE_LLAMACPP", "cpu"),
            hf_token: std::env::var("HF_TOKEN").ok(),
            ci_mode: bool_env("LEMONADE_CI_MODE", false),
            log_level: env_or("RUST_LOG", "info"),
            backend_port_range_start: parse_env("LEMONADE_BACKEND_PORT_START", 8081),
            default_ctx_size: parse_env("LEMONADE_DEFAULT_CTX_SIZE", 4096),
        }
    }

    pub fn user_models_path(&self) -> PathBuf {
        self.cache_dir.join("user_models.json")
    }

    pub fn hub_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("huggingface").join("hub")
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.cache_dir.join("lemonade.log")
    }
}

fn default_cache_dir() -> PathBuf {
    dirs_home().join(".cache").join("lemonade")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn bool_env(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_models_path_is_under_cache_dir() {
        let mut config = Config::from_env();
        config.cache_dir = PathBuf::from("/tmp/lemonade-test");
        assert_eq!(
            config.user_models_path(),
            PathBuf::from("/tmp/lemonade-test/user_models.json")
        );
    }
}
