// SPDX-License-Identifier: MIT
//! Client for the CodeQL CLI server (`codeql execute cli-server`).
//!
//! The cli-server keeps one JVM alive to execute CLI commands without
//! repeated startup overhead. Its protocol is NUL-delimited: one JSON array
//! of command arguments terminated by a NUL byte per request, one
//! NUL-terminated text response per command. The wire format carries no
//! request id, so a response can only be attributed to the oldest
//! outstanding request. The client therefore keeps exactly one command in
//! flight and queues the rest in FIFO order behind an explicit channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

use crate::config::{build_cli_server_args, CliServerConfig, WorkerKind};
use crate::engine::EngineLocator;
use crate::error::{Result, WorkerError};
use crate::frame::{encode_nul_command, NulDecoder};
use crate::process::{write_stdin, WorkerHandle};
use crate::ready::{wait_for_ready, DEFAULT_READY_TIMEOUT};

/// How long `shutdown()` waits for a natural exit before force-killing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A queued command waiting its turn on the wire.
struct QueuedCommand {
    args: Vec<String>,
    reply: oneshot::Sender<Result<String>>,
}

struct CliState {
    handle: WorkerHandle,
    stdin: Arc<Mutex<ChildStdin>>,
    queue_tx: mpsc::UnboundedSender<QueuedCommand>,
}

/// Client for the CodeQL CLI server process.
pub struct CliServerClient {
    config: CliServerConfig,
    engine: EngineLocator,
    state: Mutex<Option<CliState>>,
}

impl CliServerClient {
    pub fn new(config: CliServerConfig, engine: EngineLocator) -> Self {
        Self {
            config,
            engine,
            state: Mutex::new(None),
        }
    }

    fn label() -> &'static str {
        WorkerKind::Cli.label()
    }

    /// Start the cli-server process and wait for it to become ready.
    ///
    /// Fails with [`WorkerError::AlreadyRunning`] when the process is live.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.as_ref().is_some_and(|s| s.handle.is_running()) {
            return Err(WorkerError::AlreadyRunning {
                label: Self::label().to_string(),
            });
        }

        info!("starting CodeQL CLI server");
        let args = build_cli_server_args(&self.config);
        let (handle, stdin, stdout) = WorkerHandle::spawn(Self::label(), &self.engine, &args)?;
        let stdin = Arc::new(Mutex::new(stdin));

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_cli_stdout(stdout, handle.clone(), response_tx));
        tokio::spawn(dispatch_commands(
            Arc::clone(&stdin),
            handle.clone(),
            queue_rx,
            response_rx,
        ));

        if let Err(err) =
            wait_for_ready(Self::label(), handle.ready_rx(), handle.exit_rx(), DEFAULT_READY_TIMEOUT)
                .await
        {
            handle.force_kill().await;
            return Err(err);
        }

        *state = Some(CliState {
            handle,
            stdin,
            queue_tx,
        });
        info!("CodeQL CLI server started");
        Ok(())
    }

    /// Run a CodeQL CLI command through the persistent server and return its
    /// stdout output.
    ///
    /// Commands are queued; only one is on the wire at a time, and responses
    /// are delivered to callers in enqueue order.
    pub async fn run_command(&self, args: Vec<String>) -> Result<String> {
        let queue_tx = {
            let state = self.state.lock().await;
            match state.as_ref() {
                Some(s) if s.handle.is_running() => s.queue_tx.clone(),
                _ => {
                    return Err(WorkerError::NotRunning {
                        label: Self::label().to_string(),
                    })
                }
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        queue_tx
            .send(QueuedCommand {
                args,
                reply: reply_tx,
            })
            .map_err(|_| WorkerError::NotRunning {
                label: Self::label().to_string(),
            })?;

        match reply_rx.await {
            Ok(outcome) => outcome,
            // The dispatch task dropped our entry: the worker died while we
            // were still queued.
            Err(_) => Err(WorkerError::Exited {
                label: Self::label().to_string(),
                code: self.exit_code().await,
            }),
        }
    }

    /// Gracefully shut down the CLI server.
    ///
    /// Best-effort `["shutdown"]` write, then up to 2 s for a natural exit
    /// before force-terminating. Clears all queued and in-flight state.
    /// No-op when not running.
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(s) = state.take() else {
            return Ok(());
        };

        info!("shutting down CodeQL CLI server");
        let frame = encode_nul_command(&["shutdown".to_string()]);
        if let Err(err) = write_stdin(&s.stdin, &frame).await {
            warn!(%err, "error during CLI server shutdown request");
        }
        if !s.handle.wait_exit(SHUTDOWN_GRACE).await {
            s.handle.force_kill().await;
        }
        // Dropping queue_tx ends the dispatch task and rejects queued work.
        info!("CodeQL CLI server stopped");
        Ok(())
    }

    /// Whether the cli-server process is running.
    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.handle.is_running())
    }

    async fn exit_code(&self) -> Option<i32> {
        self.state
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.handle.exit_code())
    }
}

/// Read stdout chunks, split on NUL bytes, and forward each complete
/// response to the dispatch task. A single chunk may complete zero, one, or
/// several responses. Reaps the child on EOF.
async fn pump_cli_stdout(
    mut stdout: ChildStdout,
    handle: WorkerHandle,
    response_tx: mpsc::UnboundedSender<String>,
) {
    let mut decoder = NulDecoder::new();
    let mut buf = [0u8; 8192];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                handle.mark_ready();
                for response in decoder.push(&buf[..n]) {
                    if response_tx.send(response).is_err() {
                        return;
                    }
                }
            }
        }
    }
    let code = handle.reap().await;
    info!(worker = handle.label(), ?code, "CLI server exited");
    // Dropping response_tx tells the dispatch task the worker is gone.
}

/// Single-consumer command loop: take one queued command, write it, wait for
/// exactly one response, reply, repeat. This is what enforces the
/// one-in-flight invariant of the id-less wire format.
async fn dispatch_commands(
    stdin: Arc<Mutex<ChildStdin>>,
    handle: WorkerHandle,
    mut queue_rx: mpsc::UnboundedReceiver<QueuedCommand>,
    mut response_rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(cmd) = queue_rx.recv().await {
        let frame = encode_nul_command(&cmd.args);
        if let Err(source) = write_stdin(&stdin, &frame).await {
            let _ = cmd.reply.send(Err(WorkerError::Io {
                label: handle.label().to_string(),
                source,
            }));
            continue; // the write never reached the wire; next command may go
        }

        match response_rx.recv().await {
            Some(response) => {
                let _ = cmd.reply.send(Ok(response));
            }
            None => {
                // Worker died mid-command: reject the in-flight command and
                // stop; the queue must not advance past a dead process.
                let _ = cmd.reply.send(Err(WorkerError::Exited {
                    label: handle.label().to_string(),
                    code: handle.exit_code(),
                }));
                return;
            }
        }
    }
}
