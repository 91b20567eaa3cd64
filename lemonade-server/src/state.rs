//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use lemonade_core::adapter::default_adapters;
use lemonade_core::artifact::ArtifactStore;
use lemonade_core::hub::HubClient;
use lemonade_core::registry::Registry;
use lemonade_core::router::Router;
use lemonade_core::supervisor::Supervisor;
use lemonade_core::telemetry::Telemetry;

use crate::config::Config;
use crate::shutdown::ShutdownCoordinator;

/// Embedded builtin model catalog, shipped with the binary.
const BUILTIN_MODELS_JSON: &str = include_str!("../builtin_models.json");

/// State shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub router: Arc<Router>,
    pub artifacts: Arc<ArtifactStore>,
    pub hub: Arc<HubClient>,
    pub shutdown: ShutdownCoordinator,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        tokio::fs::create_dir_all(&config.cache_dir).await?;

        let registry = Arc::new(Registry::load(config.user_models_path(), BUILTIN_MODELS_JSON).await?);
        let artifacts = Arc::new(ArtifactStore::new(config.hub_cache_dir()));
        let hub = Arc::new(HubClient::new(config.hf_token.clone(), config.offline));
        let telemetry = Arc::new(Telemetry::new());
        let supervisor = Supervisor::new(config.backend_port_range_start);

        let router = Arc::new(Router::new(
            registry.clone(),
            default_adapters(),
            supervisor,
            artifacts.clone(),
            hub.clone(),
            config.cache_dir.join("engines"),
            telemetry,
        ));

        Ok(Self {
            config,
            registry,
            router,
            artifacts,
            hub,
            shutdown: ShutdownCoordinator::new(),
        })
    }
}
