//! Tracing setup and the runtime-reloadable log filter behind `/log-level`.

use std::sync::OnceLock;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::reload;
use tracing_subscriber::prelude::*;

type ReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

static RELOAD_HANDLE: OnceLock<ReloadHandle> = OnceLock::new();

/// Installs a `fmt` layer writing to `writer` filtered by `default_level`, plus a
/// reload layer whose handle is stashed so `/log-level` can swap the filter later.
/// Must be called exactly once, at startup.
pub fn init(default_level: &str, writer: tracing_appender::non_blocking::NonBlocking) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(default_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);

    RELOAD_HANDLE
        .set(handle)
        .map_err(|_| anyhow::anyhow!("logging::init called more than once"))?;

    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// §4.G `/log-level`: swaps the active filter. Returns an error if `init` was never
/// called (can't happen once `main` has started the server).
pub fn reload_filter(filter: EnvFilter) -> anyhow::Result<()> {
    let handle = RELOAD_HANDLE
        .get()
        .ok_or_else(|| anyhow::anyhow!("logging not initialized"))?;
    handle
        .reload(filter)
        .map_err(|e| anyhow::anyhow!("failed to reload log filter: {e}"))
}
