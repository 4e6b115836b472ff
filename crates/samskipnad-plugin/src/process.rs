//! Guest process supervision.
//!
//! The host only needs three things from the OS: spawn a binary, wait for
//! it to exit, and kill it. `ProcessSupervisor` and `ChildProcess` capture
//! exactly that, and `ProcessMonitor` turns a child into a shared handle
//! whose exit can be observed by several tasks at once.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::{oneshot, watch};

use crate::error::PluginError;

/// Upper bound for a killed process to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// A running child process.
#[async_trait]
pub trait ChildProcess: Send + 'static {
    fn id(&self) -> Option<u32>;

    async fn wait(&mut self) -> std::io::Result<ExitStatus>;

    /// Forcefully terminate and reap.
    async fn kill(&mut self) -> std::io::Result<()>;
}

/// Output of a successful spawn.
pub struct SpawnedProcess {
    pub process: Box<dyn ChildProcess>,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
}

/// Spawns guest binaries.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync + 'static {
    async fn spawn(
        &self,
        path: &Path,
        env: &[(&str, &str)],
    ) -> Result<SpawnedProcess, PluginError>;
}

// ─── tokio implementation ───────────────────────────────────────────────

/// Spawns guests with `tokio::process`, no arguments, inherited environment
/// plus the given pairs, null stdin and piped stdout/stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSupervisor;

struct TokioChild(tokio::process::Child);

#[async_trait]
impl ChildProcess for TokioChild {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.0.wait().await
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.0.kill().await
    }
}

#[async_trait]
impl ProcessSupervisor for TokioSupervisor {
    async fn spawn(
        &self,
        path: &Path,
        env: &[(&str, &str)],
    ) -> Result<SpawnedProcess, PluginError> {
        let mut command = Command::new(path);
        command
            .envs(env.iter().copied())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            PluginError::Io(std::io::Error::other("child stdout was not captured"))
        })?;
        let stderr = child.stderr.take();

        Ok(SpawnedProcess {
            process: Box::new(TokioChild(child)),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as BoxedReader),
        })
    }
}

// ─── Monitor ────────────────────────────────────────────────────────────

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReport {
    /// Exited on its own; `None` when terminated by a signal.
    Exited(Option<i32>),
    /// Killed at the host's request.
    Killed,
    /// Waiting on the process failed; it is assumed gone.
    Lost(String),
}

/// Owns a child in a background task and publishes its exit.
///
/// Dropping the monitor kills the child.
pub struct ProcessMonitor {
    pid: Option<u32>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<Option<ExitReport>>,
}

impl std::fmt::Debug for ProcessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMonitor")
            .field("pid", &self.pid)
            .field("exit", &*self.exit_rx.borrow())
            .finish()
    }
}

impl ProcessMonitor {
    pub fn start(mut process: Box<dyn ChildProcess>, plugin: &str) -> Self {
        let pid = process.id();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);
        let plugin = plugin.to_string();

        tokio::spawn(async move {
            // A dropped sender counts as a kill request.
            let exited = tokio::select! {
                status = process.wait() => Some(status),
                _ = &mut kill_rx => None,
            };

            let report = match exited {
                Some(Ok(status)) => ExitReport::Exited(status.code()),
                Some(Err(e)) => ExitReport::Lost(e.to_string()),
                None => {
                    if let Err(e) = process.kill().await {
                        tracing::warn!(plugin = %plugin, ?pid, "failed to kill plugin process: {e}");
                    }
                    ExitReport::Killed
                }
            };

            tracing::debug!(plugin = %plugin, ?pid, ?report, "plugin process ended");
            exit_tx.send_replace(Some(report));
        });

        Self {
            pid,
            kill_tx: Mutex::new(Some(kill_tx)),
            exit_rx,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    pub fn exit_report(&self) -> Option<ExitReport> {
        self.exit_rx.borrow().clone()
    }

    /// Receiver that flips to `Some` once the process is gone.
    pub fn subscribe(&self) -> watch::Receiver<Option<ExitReport>> {
        self.exit_rx.clone()
    }

    /// Wait up to `timeout` for the process to exit on its own.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<ExitReport> {
        let mut rx = self.exit_rx.clone();
        let report = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(report)) => report.clone(),
            // The monitor task is gone, so the child has been dropped (and killed).
            Ok(Err(_)) => Some(ExitReport::Killed),
            Err(_) => None,
        };
        report
    }

    /// Kill the process (if still running) and wait until it is reaped.
    pub async fn kill(&self) -> ExitReport {
        let sender = self
            .kill_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
        self.wait_for_exit(REAP_TIMEOUT)
            .await
            .unwrap_or(ExitReport::Killed)
    }
}
