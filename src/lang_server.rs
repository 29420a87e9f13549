// SPDX-License-Identifier: MIT
//! Client for the CodeQL language server (`codeql execute language-server`).
//!
//! The language server speaks LSP-style JSON-RPC with `Content-Length`
//! framing. This client handles the one-time `initialize` handshake, live
//! workspace retargeting, document open/close, completion / definition /
//! reference requests, and the `textDocument/publishDiagnostics` stream.
//! `evaluate()` validates a QL snippet by opening a
//! synthetic document and collecting the diagnostics pushed back for it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::ChildStdin;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{build_language_server_args, LanguageServerConfig, WorkerKind};
use crate::engine::EngineLocator;
use crate::error::{Result, WorkerError};
use crate::frame::encode_frame;
use crate::process::{write_stdin, WorkerHandle};
use crate::ready::{wait_for_ready, DEFAULT_READY_TIMEOUT};
use crate::rpc::{pump_rpc_stdout, PendingMap, RpcMessage};

/// Per-request timeout for LSP round trips.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Separate bound for diagnostics to arrive during `evaluate()`.
const EVALUATE_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace period before a lingering process is force-killed on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

const DIAGNOSTICS_METHOD: &str = "textDocument/publishDiagnostics";

// ─── LSP value types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// A single diagnostic pushed by the server.
/// Severity: 1 = Error, 2 = Warning, 3 = Information, 4 = Hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub range: Range,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
}

/// Payload of a `textDocument/publishDiagnostics` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextDocumentIdentifier {
    pub uri: String,
}

/// Document + cursor position for positional requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDocumentPositionParams {
    pub text_document: TextDocumentIdentifier,
    pub position: Position,
}

/// A completion item; only the fields this layer cares about are typed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionItem {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_text: Option<String>,
}

/// The canonical location shape returned by definition/reference requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LspLocation {
    pub uri: String,
    pub range: Range,
}

/// A `LocationLink`: the `target`-prefixed variant some servers return.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationLink {
    target_uri: String,
    target_range: Range,
    #[serde(default)]
    target_selection_range: Option<Range>,
}

/// The three shapes a definition/reference result may take on the wire.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GotoResult {
    Many(Vec<LspLocation>),
    Links(Vec<LocationLink>),
    One(LspLocation),
}

/// Normalize `Location | Location[] | LocationLink[]` (or null) into a
/// uniform list of `{uri, range}`.
pub fn normalize_locations(value: Value) -> Vec<LspLocation> {
    if value.is_null() {
        return Vec::new();
    }
    match serde_json::from_value::<GotoResult>(value) {
        Ok(GotoResult::Many(locations)) => locations,
        Ok(GotoResult::One(location)) => vec![location],
        Ok(GotoResult::Links(links)) => links
            .into_iter()
            .map(|link| LspLocation {
                uri: link.target_uri,
                range: link.target_selection_range.unwrap_or(link.target_range),
            })
            .collect(),
        Err(err) => {
            warn!(%err, "unrecognized location result shape");
            Vec::new()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CompletionResult {
    List { items: Vec<CompletionItem> },
    Items(Vec<CompletionItem>),
}

// ─── Client ───────────────────────────────────────────────────────────────────

struct LangState {
    handle: WorkerHandle,
    stdin: Arc<Mutex<ChildStdin>>,
}

/// Client for the CodeQL language server process.
pub struct LangServerClient {
    config: LanguageServerConfig,
    engine: EngineLocator,
    state: Mutex<Option<LangState>>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    /// `None` until the handshake completed; then the workspace URI the
    /// server was initialized (or last retargeted) with.
    workspace: Mutex<Option<Option<String>>>,
    diagnostics_tx: broadcast::Sender<PublishDiagnosticsParams>,
}

impl LangServerClient {
    pub fn new(config: LanguageServerConfig, engine: EngineLocator) -> Self {
        let (diagnostics_tx, _) = broadcast::channel(64);
        Self {
            config,
            engine,
            state: Mutex::new(None),
            pending: Arc::new(PendingMap::new()),
            next_id: AtomicU64::new(1),
            workspace: Mutex::new(None),
            diagnostics_tx,
        }
    }

    fn label() -> &'static str {
        WorkerKind::Language.label()
    }

    /// Start the language server process and wait for it to become ready.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.as_ref().is_some_and(|s| s.handle.is_running()) {
            return Err(WorkerError::AlreadyRunning {
                label: Self::label().to_string(),
            });
        }

        info!("starting CodeQL language server");
        let args = build_language_server_args(&self.config);
        let (handle, stdin, stdout) = WorkerHandle::spawn(Self::label(), &self.engine, &args)?;

        let diagnostics_tx = self.diagnostics_tx.clone();
        tokio::spawn(pump_rpc_stdout(
            stdout,
            handle.clone(),
            Arc::clone(&self.pending),
            move |method, params| {
                if method != DIAGNOSTICS_METHOD {
                    return; // other notifications are ignored at this layer
                }
                match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(diagnostics) => {
                        let _ = diagnostics_tx.send(diagnostics);
                    }
                    Err(err) => warn!(%err, "malformed publishDiagnostics payload"),
                }
            },
        ));

        if let Err(err) =
            wait_for_ready(Self::label(), handle.ready_rx(), handle.exit_rx(), DEFAULT_READY_TIMEOUT)
                .await
        {
            handle.force_kill().await;
            return Err(err);
        }

        *state = Some(LangState {
            handle,
            stdin: Arc::new(Mutex::new(stdin)),
        });
        *self.workspace.lock().await = None;
        info!("CodeQL language server started");
        Ok(())
    }

    /// Perform the LSP handshake, once per client lifetime.
    ///
    /// Calling again with the same workspace is a no-op. Calling again with
    /// a *different* workspace sends a single
    /// `workspace/didChangeWorkspaceFolders` notification instead of a
    /// second handshake; retargeting is cheap where a restart is not.
    pub async fn initialize(&self, workspace_uri: Option<String>) -> Result<()> {
        let mut workspace = self.workspace.lock().await;

        if let Some(current) = workspace.clone() {
            if current == workspace_uri {
                debug!("language server already initialized with this workspace");
                return Ok(());
            }
            info!(
                from = ?current,
                to = ?workspace_uri,
                "retargeting language server workspace"
            );
            let params = json!({
                "event": {
                    "added": workspace_uri.as_deref().map(workspace_folder).into_iter().collect::<Vec<_>>(),
                    "removed": current.as_deref().map(workspace_folder).into_iter().collect::<Vec<_>>(),
                }
            });
            self.send_notification("workspace/didChangeWorkspaceFolders", params)
                .await?;
            *workspace = Some(workspace_uri);
            return Ok(());
        }

        info!("initializing CodeQL language server");
        let mut params = json!({
            "processId": std::process::id(),
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "textDocument": {
                    "synchronization": {
                        "didOpen": true,
                        "didChange": true,
                        "didClose": true,
                    },
                    "publishDiagnostics": {},
                }
            }
        });
        if let Some(uri) = &workspace_uri {
            params["workspaceFolders"] = json!([workspace_folder(uri)]);
        }

        self.send_request("initialize", params).await?;
        self.send_notification("initialized", json!({})).await?;
        *workspace = Some(workspace_uri);
        info!("CodeQL language server initialized");
        Ok(())
    }

    /// Open a document. Requires `initialize` to have completed.
    /// Fire-and-forget; callers are responsible for closing it again; the
    /// client does not auto-close.
    pub async fn open_document(&self, uri: &str, text: &str) -> Result<()> {
        self.ensure_initialized().await?;
        self.send_notification(
            "textDocument/didOpen",
            json!({
                "textDocument": {
                    "uri": uri,
                    "languageId": "ql",
                    "version": 1,
                    "text": text,
                }
            }),
        )
        .await
    }

    /// Close a previously opened document. Requires `initialize` to have
    /// completed.
    pub async fn close_document(&self, uri: &str) -> Result<()> {
        self.ensure_initialized().await?;
        self.send_notification(
            "textDocument/didClose",
            json!({ "textDocument": { "uri": uri } }),
        )
        .await
    }

    /// Code completions at a position. Requires `initialize` to have
    /// completed and the document to be open.
    pub async fn get_completions(
        &self,
        params: TextDocumentPositionParams,
    ) -> Result<Vec<CompletionItem>> {
        self.ensure_initialized().await?;
        let result = self
            .send_request("textDocument/completion", position_params(&params)?)
            .await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        match serde_json::from_value::<CompletionResult>(result) {
            Ok(CompletionResult::List { items }) | Ok(CompletionResult::Items(items)) => Ok(items),
            Err(err) => {
                warn!(%err, "unrecognized completion result shape");
                Ok(Vec::new())
            }
        }
    }

    /// Go-to-definition locations for the symbol at a position.
    pub async fn get_definition(
        &self,
        params: TextDocumentPositionParams,
    ) -> Result<Vec<LspLocation>> {
        self.ensure_initialized().await?;
        let result = self
            .send_request("textDocument/definition", position_params(&params)?)
            .await?;
        Ok(normalize_locations(result))
    }

    /// All references to the symbol at a position, declaration included.
    pub async fn get_references(
        &self,
        params: TextDocumentPositionParams,
    ) -> Result<Vec<LspLocation>> {
        self.ensure_initialized().await?;
        let mut request = position_params(&params)?;
        request["context"] = json!({ "includeDeclaration": true });
        let result = self.send_request("textDocument/references", request).await?;
        Ok(normalize_locations(result))
    }

    /// Validate a QL snippet: open it as a synthetic document, wait for the
    /// diagnostics the server pushes back for that document, close it, and
    /// return the diagnostics.
    ///
    /// The wait has its own 5 s bound, distinct from the request timeout.
    /// Concurrent evaluations are safe as long as their URIs differ; each
    /// ignores diagnostics addressed to other documents; the default URI is
    /// generated fresh per call.
    pub async fn evaluate(&self, code: &str, uri: Option<String>) -> Result<Vec<Diagnostic>> {
        self.ensure_initialized().await?;

        let document_uri = uri.unwrap_or_else(|| {
            let path = std::env::temp_dir().join(format!("ql-eval-{}.ql", Uuid::new_v4()));
            format!("file://{}", path.display())
        });

        // Subscribe before opening so the triggering notification cannot be
        // missed.
        let mut diagnostics_rx = self.diagnostics_tx.subscribe();
        self.open_document(&document_uri, code).await?;

        let deadline = Instant::now() + EVALUATE_TIMEOUT;
        let outcome = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(self.evaluate_timeout_error());
            }
            match tokio::time::timeout(remaining, diagnostics_rx.recv()).await {
                Err(_) => break Err(self.evaluate_timeout_error()),
                Ok(Ok(params)) if params.uri == document_uri => break Ok(params.diagnostics),
                Ok(Ok(_)) => continue, // diagnostics for a different document
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(skipped, "diagnostics stream lagged during evaluate");
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    break Err(WorkerError::Exited {
                        label: Self::label().to_string(),
                        code: None,
                    })
                }
            }
        };

        // Best-effort close of the synthetic document either way.
        let _ = self.close_document(&document_uri).await;
        outcome
    }

    fn evaluate_timeout_error(&self) -> WorkerError {
        WorkerError::Timeout {
            label: Self::label().to_string(),
            method: DIAGNOSTICS_METHOD.to_string(),
            ms: EVALUATE_TIMEOUT.as_millis() as u64,
        }
    }

    /// Subscribe to the diagnostics notification stream.
    pub fn subscribe(&self) -> broadcast::Receiver<PublishDiagnosticsParams> {
        self.diagnostics_tx.subscribe()
    }

    /// Gracefully shut down: `shutdown` request plus `exit` notification,
    /// then up to 1 s for the process to leave before force-killing it.
    /// Always clears initialization state.
    pub async fn shutdown(&self) -> Result<()> {
        let running = self.state.lock().await.is_some();
        if !running {
            *self.workspace.lock().await = None;
            return Ok(());
        }

        info!("shutting down CodeQL language server");
        if let Err(err) = self
            .send_request_with_timeout("shutdown", json!({}), Duration::from_secs(1))
            .await
        {
            warn!(%err, "error during graceful language server shutdown");
        }
        if let Err(err) = self.send_notification("exit", json!({})).await {
            debug!(%err, "exit notification not delivered");
        }

        let mut state = self.state.lock().await;
        if let Some(s) = state.take() {
            if !s.handle.wait_exit(SHUTDOWN_GRACE).await {
                s.handle.force_kill().await;
            }
        }
        *self.workspace.lock().await = None;
        info!("CodeQL language server stopped");
        Ok(())
    }

    /// Whether the language server process is running.
    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.handle.is_running())
    }

    // ─── Internals ────────────────────────────────────────────────────────

    async fn ensure_initialized(&self) -> Result<()> {
        if self.workspace.lock().await.is_none() {
            return Err(WorkerError::NotInitialized);
        }
        if !self.is_running().await {
            return Err(WorkerError::NotRunning {
                label: Self::label().to_string(),
            });
        }
        Ok(())
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

    async fn send_request(&self, method: &str, params: Value) -> Result<Value> {
        self.send_request_with_timeout(method, params, REQUEST_TIMEOUT)
            .await
    }

    async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let stdin = self.running_stdin().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let receiver = self.pending.insert(id);
        let frame = encode_frame(&RpcMessage::request(id, method, params));

        if let Err(source) = write_stdin(&stdin, &frame).await {
            // The request never reached the wire; the entry must not dangle.
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

    async fn send_notification(&self, method: &str, params: Value) -> Result<()> {
        let stdin = self.running_stdin().await?;
        let frame = encode_frame(&RpcMessage::notification(method, params));
        write_stdin(&stdin, &frame)
            .await
            .map_err(|source| WorkerError::Io {
                label: Self::label().to_string(),
                source,
            })
    }
}

fn workspace_folder(uri: &str) -> Value {
    json!({ "uri": uri, "name": "codeql-workspace" })
}

fn position_params(params: &TextDocumentPositionParams) -> Result<Value> {
    serde_json::to_value(params).map_err(|err| WorkerError::Protocol {
        label: WorkerKind::Language.label().to_string(),
        message: err.to_string(),
    })
}

// ─── Tests ────────────────────────────────────────────────────────────────────
