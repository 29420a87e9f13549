// SPDX-License-Identifier: MIT
//! Spawned worker plumbing shared by all three protocol clients.
//!
//! A [`WorkerHandle`] wraps a spawned `codeql` subprocess: it pumps stderr
//! into debug logs, publishes a readiness signal on the first byte of output,
//! and tracks the exit state on a watch channel. The child handle itself
//! lives behind `Arc<Mutex<Option<Child>>>` so the stdout reader (which reaps
//! on EOF) and shutdown paths (which may force-kill) race safely: whoever
//! takes the child owns the wait.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::engine::EngineLocator;
use crate::error::{Result, WorkerError};

/// Observable lifecycle state of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Running,
    /// Exited with the given code (`None` when killed by a signal).
    Exited(Option<i32>),
}

/// Handle to a live (or recently exited) worker process.
///
/// Cheap to clone; all clones share the same child and channels.
#[derive(Clone)]
pub struct WorkerHandle {
    label: Arc<str>,
    child: Arc<Mutex<Option<Child>>>,
    exit_tx: Arc<watch::Sender<ExitState>>,
    ready_tx: Arc<watch::Sender<bool>>,
}

impl WorkerHandle {
    /// Spawn a worker with piped stdio.
    ///
    /// The engine's bin directory (when known) is prepended to the child's
    /// `PATH`. Stderr is drained in a background task: its content is only a
    /// liveness/diagnostic signal, logged at debug, never parsed.
    pub fn spawn(
        label: &str,
        engine: &EngineLocator,
        args: &[String],
    ) -> Result<(Self, ChildStdin, ChildStdout)> {
        let mut cmd = Command::new(engine.program());
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = engine.spawn_path() {
            cmd.env("PATH", path);
        }

        let mut child = cmd.spawn().map_err(|source| WorkerError::Spawn {
            label: label.to_string(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| WorkerError::Spawn {
            label: label.to_string(),
            source: std::io::Error::other("stdin not piped"),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| WorkerError::Spawn {
            label: label.to_string(),
            source: std::io::Error::other("stdout not piped"),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| WorkerError::Spawn {
            label: label.to_string(),
            source: std::io::Error::other("stderr not piped"),
        })?;

        let (exit_tx, _) = watch::channel(ExitState::Running);
        let (ready_tx, _) = watch::channel(false);
        let handle = Self {
            label: Arc::from(label),
            child: Arc::new(Mutex::new(Some(child))),
            exit_tx: Arc::new(exit_tx),
            ready_tx: Arc::new(ready_tx),
        };

        tokio::spawn(pump_stderr(stderr, handle.clone()));
        Ok((handle, stdin, stdout))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Record that the worker produced its first output.
    pub fn mark_ready(&self) {
        self.ready_tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        });
    }

    pub fn ready_rx(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    pub fn exit_rx(&self) -> watch::Receiver<ExitState> {
        self.exit_tx.subscribe()
    }

    pub fn exit_state(&self) -> ExitState {
        *self.exit_tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.exit_state() == ExitState::Running
    }

    /// Exit code, once the process has exited.
    pub fn exit_code(&self) -> Option<i32> {
        match self.exit_state() {
            ExitState::Running => None,
            ExitState::Exited(code) => code,
        }
    }

    /// Reap the child after its stdout reached EOF and publish the exit code.
    ///
    /// No-op when another path (force-kill) already took the child; in that
    /// case the published exit state is returned as-is.
    pub async fn reap(&self) -> Option<i32> {
        let taken = self.child.lock().await.take();
        if let Some(mut child) = taken {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(worker = %self.label, %err, "failed to reap worker process");
                    None
                }
            };
            debug!(worker = %self.label, ?code, "worker exited");
            // send_replace stores the state even with no live receivers;
            // plain send would drop it and leave is_running() stuck true.
            self.exit_tx.send_replace(ExitState::Exited(code));
            code
        } else {
            self.exit_code()
        }
    }

    /// Kill the process and reap it. Errors are ignored; the process may
    /// already have exited on its own.
    pub async fn force_kill(&self) {
        let taken = self.child.lock().await.take();
        if let Some(mut child) = taken {
            let _ = child.kill().await;
            let code = child.wait().await.ok().and_then(|status| status.code());
            debug!(worker = %self.label, ?code, "worker force-killed");
            self.exit_tx.send_replace(ExitState::Exited(code));
        }
    }

    /// Wait up to `timeout` for the process to exit on its own.
    /// Returns true when it did.
    pub async fn wait_exit(&self, timeout: std::time::Duration) -> bool {
        let mut exit = self.exit_rx();
        let outcome = tokio::time::timeout(
            timeout,
            exit.wait_for(|state| matches!(state, ExitState::Exited(_))),
        )
        .await;
        outcome.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineLocator;
    use std::time::Duration;

    #[cfg(unix)]
    #[tokio::test]
    async fn reap_records_exit_without_subscribers() {
        let engine = EngineLocator::new("true");
        let (handle, _stdin, _stdout) =
            WorkerHandle::spawn("reap-test", &engine, &[]).unwrap();
        assert_eq!(handle.reap().await, Some(0));
        assert!(!handle.is_running());
        assert_eq!(handle.exit_code(), Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn force_kill_publishes_exit_state() {
        let engine = EngineLocator::new("sleep");
        let (handle, _stdin, _stdout) =
            WorkerHandle::spawn("kill-test", &engine, &["30".to_string()]).unwrap();
        assert!(handle.is_running());
        handle.force_kill().await;
        assert!(!handle.is_running());
        assert!(handle.wait_exit(Duration::from_millis(50)).await);
    }
}

/// Write bytes to a worker's stdin and flush. The stdin mutex makes the
/// protocol client the sole writer to the stream.
pub(crate) async fn write_stdin(
    stdin: &Mutex<ChildStdin>,
    bytes: &[u8],
) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut guard = stdin.lock().await;
    guard.write_all(bytes).await?;
    guard.flush().await
}

/// Drain worker stderr, marking readiness on the first chunk and logging the
/// output at debug level.
async fn pump_stderr(mut stderr: tokio::process::ChildStderr, handle: WorkerHandle) {
    let mut buf = [0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                handle.mark_ready();
                let text = String::from_utf8_lossy(&buf[..n]);
                for line in text.lines().filter(|l| !l.trim().is_empty()) {
                    debug!(worker = %handle.label, "stderr: {line}");
                }
            }
        }
    }
}
