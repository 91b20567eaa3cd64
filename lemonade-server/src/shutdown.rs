//! §4.I shutdown coordinator: ties `/shutdown`, SIGINT/SIGTERM, and the graceful-drain
//! deadline together into one signal `main.rs`'s server loop awaits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// How long the coordinator waits for in-flight requests to finish once a shutdown
/// has been requested, before the caller should stop waiting and exit anyway.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(5);
/// A second signal within this window forces an immediate exit.
pub const FORCE_EXIT_WINDOW: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct ShutdownCoordinator {
    notify: Arc<Notify>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self { notify: Arc::new(Notify::new()) }
    }

    /// Requests a shutdown; idempotent. Called from `/shutdown` or a signal handler.
    pub fn trigger(&self) {
        self.notify.notify_waiters();
    }

    /// Resolves the first time `trigger` is called. Intended for
    /// `axum::serve(...).with_graceful_shutdown(...)`.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves on SIGINT, SIGTERM (unix) or either the first trigger of `coordinator`.
/// A second OS signal within [`FORCE_EXIT_WINDOW`] exits the process immediately
/// rather than waiting out the drain deadline.
pub async fn signal_or_trigger(coordinator: ShutdownCoordinator) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = coordinator.wait() => { return; },
    }

    coordinator.trigger();

    // A second signal before FORCE_EXIT_WINDOW elapses means "stop waiting, now".
    let second_signal = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            #[cfg(unix)]
            _ = async {
                let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
                sigterm.recv().await;
            } => {},
        }
    };
    if tokio::time::timeout(FORCE_EXIT_WINDOW, second_signal).await.is_ok() {
        tracing::warn!("second shutdown signal received, forcing immediate exit");
        std::process::exit(15);
    }
}
