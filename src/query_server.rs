// SPDX-License-Identifier: MIT
//! Client for the CodeQL query server (`codeql execute query-server2`).
//!
//! Same `Content-Length`-framed JSON-RPC wire as the language server, but
//! no LSP handshake: callers send evaluation-protocol requests directly
//! (`evaluation/registerDatabases`, `evaluation/runQueries`, ...). Query
//! compilation and evaluation can take minutes, so the default request
//! timeout is far larger than the language server's.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::process::ChildStdin;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::config::{build_query_server_args, QueryServerConfig, WorkerKind};
use crate::engine::EngineLocator;
use crate::error::{Result, WorkerError};
use crate::frame::encode_frame;
use crate::process::{write_stdin, WorkerHandle};
use crate::ready::{wait_for_ready, DEFAULT_READY_TIMEOUT};
use crate::rpc::{pump_rpc_stdout, Notification, PendingMap, RpcMessage};

/// Default bound for query-server requests. Evaluation is slow.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
/// Bound for the graceful shutdown request itself.
const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace period before a lingering process is force-killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

struct QueryState {
    handle: WorkerHandle,
    stdin: Arc<Mutex<ChildStdin>>,
}

/// Client for the CodeQL query server process.
pub struct QueryServerClient {
    config: QueryServerConfig,
    engine: EngineLocator,
    state: Mutex<Option<QueryState>>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    notifications_tx: broadcast::Sender<Notification>,
}

impl QueryServerClient {
    pub fn new(config: QueryServerConfig, engine: EngineLocator) -> Self {
        let (notifications_tx, _) = broadcast::channel(256);
        Self {
            config,
            engine,
            state: Mutex::new(None),
            pending: Arc::new(PendingMap::new()),
            next_id: AtomicU64::new(1),
            notifications_tx,
        }
    }

    fn label() -> &'static str {
        WorkerKind::Query.label()
    }

    /// Start the query server process and wait for it to become ready.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.as_ref().is_some_and(|s| s.handle.is_running()) {
            return Err(WorkerError::AlreadyRunning {
                label: Self::label().to_string(),
            });
        }

        info!("starting CodeQL query server");
        let args = build_query_server_args(&self.config);
        let (handle, stdin, stdout) = WorkerHandle::spawn(Self::label(), &self.engine, &args)?;

        let notifications_tx = self.notifications_tx.clone();
        tokio::spawn(pump_rpc_stdout(
            stdout,
            handle.clone(),
            Arc::clone(&self.pending),
            move |method, params| {
                // Progress and log notifications stream constantly during
                // evaluation; forward them all and let subscribers filter.
                let _ = notifications_tx.send(Notification {
                    method: method.to_string(),
                    params,
                });
            },
        ));

        if let Err(err) =
            wait_for_ready(Self::label(), handle.ready_rx(), handle.exit_rx(), DEFAULT_READY_TIMEOUT)
                .await
        {
            handle.force_kill().await;
            return Err(err);
        }

        *state = Some(QueryState {
            handle,
            stdin: Arc::new(Mutex::new(stdin)),
        });
        info!("CodeQL query server started");
        Ok(())
    }

    /// Send an evaluation-protocol request with the default 300 s timeout.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value> {
        self.send_request_with_timeout(method, params, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    /// Send an evaluation-protocol request with an explicit timeout.
    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let stdin = self.running_stdin().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let receiver = self.pending.insert(id);
        let frame = encode_frame(&RpcMessage::request(id, method, params));

        debug!(method, id, "sending query server request");
        if let Err(source) = write_stdin(&stdin, &frame).await {
            self.pending.remove(id);
            return Err(WorkerError::Io {
                label: Self::label().to_string(),
                source,
            });
        }

        match tokio::time::timeout(timeout, receiver).await {
            Err(_) => {
                self.pending.remove(id);
                Err(WorkerError::Timeout {
                    label: Self::label().to_string(),
                    method: method.to_string(),
                    ms: timeout.as_millis() as u64,
                })
            }
            Ok(Err(_)) => Err(WorkerError::Exited {
                label: Self::label().to_string(),
                code: None,
            }),
            Ok(Ok(outcome)) => outcome,
        }
    }

    /// Subscribe to the server's notification stream (progress updates,
    /// evaluation logs).
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications_tx.subscribe()
    }

    /// Gracefully shut down: `shutdown` request with a short bound, then up
    /// to 2 s for the process to leave before force-killing it.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.is_running().await {
            self.state.lock().await.take();
            return Ok(());
        }

        info!("shutting down CodeQL query server");
        if let Err(err) = self
            .send_request_with_timeout("shutdown", json!({}), SHUTDOWN_REQUEST_TIMEOUT)
            .await
        {
            warn!(%err, "error during graceful query server shutdown");
        }

        let mut state = self.state.lock().await;
        if let Some(s) = state.take() {
            if !s.handle.wait_exit(SHUTDOWN_GRACE).await {
                s.handle.force_kill().await;
            }
        }
        info!("CodeQL query server stopped");
        Ok(())
    }

    /// Whether the query server process is running.
    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.handle.is_running())
    }

    /// Exit code of the last process, if it has exited.
    pub async fn exit_code(&self) -> Option<i32> {
        self.state.lock().await.as_ref().and_then(|s| s.handle.exit_code())
    }

    async fn running_stdin(&self) -> Result<Arc<Mutex<ChildStdin>>> {
        let state = self.state.lock().await;
        match state.as_ref() {
            Some(s) if s.handle.is_running() => Ok(Arc::clone(&s.stdin)),
            _ => Err(WorkerError::NotRunning {
                label: Self::label().to_string(),
            }),
        }
    }
}
