//! Spawns, health-checks, and tears down backend child processes.
//!
//! Grounded on `slab-server/src/state.rs`'s `TaskManager` (id-keyed handle map with a
//! `cancel`/`remove` pair) generalized from abortable tokio tasks to OS child
//! processes, and on `slab-core/src/services/ffmpeg.rs`'s `spawn_blocking` reader-loop
//! pattern for draining a child's stdio without blocking the async runtime.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::adapter::LaunchPlan;
use crate::error::CoreError;

/// How long to wait for a child's readiness endpoint before giving up (§4.E).
const READY_TIMEOUT: Duration = Duration::from_secs(120);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Grace period between SIGTERM and SIGKILL during shutdown.
const TERM_GRACE: Duration = Duration::from_secs(10);
/// Number of trailing log lines kept per backend in memory for `/logs`.
const LOG_RING_CAPACITY: usize = 2000;

/// Rolling buffer of a backend's merged stdout/stderr lines.
#[derive(Default)]
pub struct LogRing {
    lines: Mutex<VecDeque<String>>,
}

impl LogRing {
    fn new() -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY)),
        }
    }

    async fn push(&self, line: String) {
        let mut lines = self.lines.lock().await;
        if lines.len() >= LOG_RING_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub async fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock().await;
        lines.iter().rev().take(n).rev().cloned().collect()
    }
}

/// A running backend process, plus the metadata the router needs to talk to it.
pub struct RunningBackend {
    pub port: u16,
    pub route_prefix: &'static str,
    pub logs: Arc<LogRing>,
    child: Child,
}

impl RunningBackend {
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

pub struct Supervisor {
    next_port: AtomicU16,
    client: reqwest::Client,
}

impl Supervisor {
    pub fn new(port_range_start: u16) -> Self {
        Self {
            next_port: AtomicU16::new(port_range_start),
            client: reqwest::Client::new(),
        }
    }

    pub fn allocate_port(&self) -> u16 {
        self.next_port.fetch_add(1, Ordering::SeqCst)
    }

    /// Spawn `plan`'s program, stream its stdio into a [`LogRing`], and block until
    /// its readiness endpoint answers or [`READY_TIMEOUT`] elapses.
    pub async fn spawn_and_wait_ready(&self, plan: LaunchPlan) -> Result<RunningBackend, CoreError> {
        let port = plan.port;

        let mut child = Command::new(&plan.program)
            .args(&plan.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::BackendLoadFailed {
                message: format!("failed to spawn {}: {e}", plan.program.display()),
            })?;

        let logs = Arc::new(LogRing::new());
        spawn_log_reader(child.stdout.take(), logs.clone());
        spawn_log_reader(child.stderr.take(), logs.clone());

        let ready_url = format!("http://127.0.0.1:{port}{}", plan.ready_path);
        let deadline = Instant::now() + READY_TIMEOUT;
        loop {
            if let Some(status) = child.try_wait().map_err(CoreError::from)? {
                return Err(CoreError::BackendLoadFailed {
                    message: format!("process exited early with {status} before becoming ready"),
                });
            }
            if self.client.get(&ready_url).send().await.is_ok_and(|r| r.status().is_success()) {
                break;
            }
            if Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(CoreError::BackendLoadFailed {
                    message: format!("{} did not become ready within {:?}", plan.program.display(), READY_TIMEOUT),
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }

        Ok(RunningBackend {
            port,
            route_prefix: plan.route_prefix,
            logs,
            child,
        })
    }

    /// Two-phase shutdown: SIGTERM (or `Child::start_kill` on platforms without
    /// signals), then SIGKILL after [`TERM_GRACE`] if the process is still alive.
    pub async fn shutdown(&self, backend: &mut RunningBackend) -> Result<(), CoreError> {
        terminate(&mut backend.child);
        match tokio::time::timeout(TERM_GRACE, backend.child.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => {
                backend.child.start_kill().ok();
                backend.child.wait().await.ok();
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc_kill(pid as i32, 15); // SIGTERM
        }
    }
}

#[cfg(unix)]
unsafe fn libc_kill(pid: i32, sig: i32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    kill(pid, sig);
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

fn spawn_log_reader<R>(pipe: Option<R>, logs: Arc<LogRing>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let Some(pipe) = pipe else { return };
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "backend", "{line}");
            logs.push(line).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_ring_caps_and_tails_in_order() {
        let ring = LogRing::new();
        for i in 0..5 {
            ring.push(format!("line {i}")).await;
        }
        let tail = ring.tail(2).await;
        assert_eq!(tail, vec!["line 3".to_string(), "line 4".to_string()]);
    }

    #[tokio::test]
    async fn spawn_nonexistent_program_reports_backend_load_failed() {
        let supervisor = Supervisor::new(18000);
        let plan = LaunchPlan {
            program: "/nonexistent/does-not-exist".into(),
            args: vec![],
            port: supervisor.allocate_port(),
            ready_path: "/health",
            route_prefix: "/v1",
        };
        let err = supervisor.spawn_and_wait_ready(plan).await.unwrap_err();
        assert_eq!(err.kind(), "backend_load_failed");
    }
}
