//! lemonade-server – entry point.
//!
//! Startup order:
//! 1. Parse the CLI surface (`serve`, `pull`, `list`, `run`, `stop`).
//! 2. Parse configuration from environment variables, applying CLI overrides.
//! 3. Initialise structured tracing, with a reloadable filter for `/log-level`.
//! 4. Build shared application state (registry, router, artifact store, hub).
//! 5. Build the Axum router and start the HTTP server with graceful shutdown.

mod config;
mod error;
mod logging;
mod routes;
mod shutdown;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::Config;
use crate::state::AppState;

#[derive(Parser)]
#[command(name = "lemonade-server", version, about = "Local LLM inference gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP gateway (the default if no subcommand is given).
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long = "ctx-size")]
        ctx_size: Option<u32>,
        #[arg(long)]
        llamacpp: Option<String>,
        /// Accepted for CLI compatibility; this build has no tray UI to suppress.
        #[arg(long = "no-tray")]
        no_tray: bool,
    },
    /// Download a model's artifacts without loading it.
    Pull { name: String },
    /// List registered models.
    List {
        #[arg(long = "show-all")]
        show_all: bool,
    },
    /// Load and hold a model until interrupted.
    Run { name: String },
    /// Ask a running gateway to shut down.
    Stop,
}

#[tokio::main]
async fn main() {
    let exit_code = run().await;
    std::process::exit(exit_code);
}

async fn run() -> i32 {
    let cli = Cli::parse();
    let mut config = Config::from_env();

    match cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
        ctx_size: None,
        llamacpp: None,
        no_tray: false,
    }) {
        Command::Serve { host, port, ctx_size, llamacpp, no_tray: _ } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(ctx_size) = ctx_size {
                config.default_ctx_size = ctx_size;
            }
            if let Some(llamacpp) = llamacpp {
                config.llamacpp_backend = llamacpp;
            }
            match serve(config).await {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("lemonade-server: {e}");
                    1
                }
            }
        }
        Command::Pull { name } => run_cli_pull(config, name).await,
        Command::List { show_all } => run_cli_list(config, show_all).await,
        Command::Run { name } => run_cli_run(config, name).await,
        Command::Stop => run_cli_stop(config).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let log_level = config.log_level.clone();
    let log_file = config.log_file_path();

    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_appender = tracing_appender::rolling::never(
        log_file.parent().unwrap_or_else(|| std::path::Path::new(".")),
        log_file.file_name().unwrap_or_default(),
    );
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    logging::init(&log_level, non_blocking)?;

    info!(version = env!("CARGO_PKG_VERSION"), %addr, "lemonade-server starting");

    let state = Arc::new(AppState::new(config).await?);
    let app = routes::build().with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    let shutdown = state.shutdown.clone();
    let signal_task = tokio::spawn(shutdown::signal_or_trigger(shutdown.clone()));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.wait())
        .await?;

    tokio::time::timeout(shutdown::DRAIN_DEADLINE, state.router.unload(None))
        .await
        .ok();
    signal_task.abort();

    info!("lemonade-server stopped");
    Ok(())
}

async fn run_cli_pull(config: Config, name: String) -> i32 {
    match AppState::new(config).await {
        Ok(state) => {
            let entry = match state.registry.get(&name).await {
                Some(e) => e,
                None => {
                    eprintln!("lemonade-server: unknown model {name:?}");
                    return 1;
                }
            };
            let (repo_id, _variant) = entry.repo_and_variant();
            let manifest = match state.hub.list_files(repo_id, &state.artifacts).await {
                Ok(m) => m,
                Err(e) => {
                    eprintln!("lemonade-server: {e}");
                    return 1;
                }
            };
            let task = lemonade_core::hub::DownloadTask::new(repo_id.to_string(), manifest);
            match state
                .hub
                .download_files(&task, &state.artifacts, |p| {
                    eprintln!("{:.1}% ({}/{})", p.percent, p.file_index, p.total_files);
                })
                .await
            {
                Ok(()) => {
                    state.registry.mark_downloaded(&name, None).await;
                    0
                }
                Err(e) => {
                    eprintln!("lemonade-server: {e}");
                    1
                }
            }
        }
        Err(e) => {
            eprintln!("lemonade-server: {e}");
            1
        }
    }
}

async fn run_cli_list(config: Config, show_all: bool) -> i32 {
    match AppState::new(config).await {
        Ok(state) => {
            let filter = lemonade_core::registry::ListFilter {
                downloaded_only: !show_all,
                ..Default::default()
            };
            for entry in state.registry.list(&filter).await {
                println!("{}\t{}\t{}", entry.name, entry.backend_kind, entry.checkpoint);
            }
            0
        }
        Err(e) => {
            eprintln!("lemonade-server: {e}");
            1
        }
    }
}

async fn run_cli_run(config: Config, name: String) -> i32 {
    match AppState::new(config).await {
        Ok(state) => {
            match state.router.load(&name, lemonade_core::adapter::LoadOptions::default()).await {
                Ok(summary) => {
                    println!("loaded {} ({})", summary.model_name, summary.recipe);
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = state.router.unload(Some(&name)).await;
                    15
                }
                Err(e) => {
                    eprintln!("lemonade-server: {e}");
                    1
                }
            }
        }
        Err(e) => {
            eprintln!("lemonade-server: {e}");
            1
        }
    }
}

/// `stop`: asks a running gateway on the configured host/port to shut down.
async fn run_cli_stop(config: Config) -> i32 {
    let url = format!("http://{}:{}/shutdown", config.host, config.port);
    match reqwest::Client::new().post(&url).send().await {
        Ok(resp) if resp.status().is_success() => 0,
        Ok(resp) => {
            eprintln!("lemonade-server: stop request returned {}", resp.status());
            1
        }
        Err(e) => {
            eprintln!("lemonade-server: no gateway reachable at {url}: {e}");
            2
        }
    }
}
