// SPDX-License-Identifier: MIT
//! JSON-RPC plumbing shared by the language-server and query-server clients.
//!
//! Both speak `Content-Length`-framed JSON-RPC 2.0 over stdio. Responses
//! correlate strictly by numeric id and may arrive out of order; messages
//! with a method but no matching pending id are notifications.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{Result, WorkerError};
use crate::frame::HeaderDecoder;
use crate::process::WorkerHandle;

// ─── Wire types ───────────────────────────────────────────────────────────────

/// A JSON-RPC 2.0 message (request, response, or notification).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcMessage {
    pub fn request(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }
}

/// A server-reported error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A server-pushed notification: method name plus parameters.
#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

// ─── Pending requests ─────────────────────────────────────────────────────────

/// Outstanding requests awaiting a response, keyed by id.
///
/// An entry lives from request-send until a matching response, a process
/// exit, or a timeout, whichever comes first removes it.
#[derive(Default)]
pub(crate) struct PendingMap {
    inner: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
}

impl PendingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request and return the receiver for its outcome.
    pub fn insert(&self, id: u64) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().expect("pending map lock").insert(id, tx);
        rx
    }

    /// Drop a pending entry (timeout or failed write).
    pub fn remove(&self, id: u64) {
        self.inner.lock().expect("pending map lock").remove(&id);
    }

    /// Settle the pending request matching a response message, if any.
    /// Returns false when the id is not ours.
    pub fn complete(&self, label: &str, id: u64, message: &Value) -> bool {
        let Some(tx) = self.inner.lock().expect("pending map lock").remove(&id) else {
            return false;
        };
        let outcome = match message.get("error").filter(|e| !e.is_null()) {
            Some(error) => {
                let detail = error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                Err(WorkerError::Protocol {
                    label: label.to_string(),
                    message: detail,
                })
            }
            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = tx.send(outcome);
        true
    }

    /// Reject every outstanding request. Process death cancels all pending
    /// work atomically; none may be left dangling.
    pub fn reject_all(&self, mut make_error: impl FnMut() -> WorkerError) {
        let drained: Vec<_> = self
            .inner
            .lock()
            .expect("pending map lock")
            .drain()
            .collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(make_error()));
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending map lock").len()
    }
}

// ─── Stdout pump ──────────────────────────────────────────────────────────────

/// Read framed messages from a worker's stdout until EOF, routing responses
/// through the pending map and everything method-only to `on_notify`.
///
/// On EOF the child is reaped and every still-pending request is rejected
/// with the exit code.
pub(crate) async fn pump_rpc_stdout<F>(
    mut stdout: ChildStdout,
    handle: WorkerHandle,
    pending: std::sync::Arc<PendingMap>,
    on_notify: F,
) where
    F: Fn(&str, Value) + Send + 'static,
{
    let mut decoder = HeaderDecoder::new();
    let mut buf = [0u8; 8192];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                handle.mark_ready();
                for message in decoder.push(&buf[..n]) {
                    dispatch(handle.label(), message, &pending, &on_notify);
                }
            }
        }
    }

    let code = handle.reap().await;
    let label = handle.label().to_string();
    debug!(worker = %label, ?code, "stdout closed, rejecting pending requests");
    pending.reject_all(|| WorkerError::Exited {
        label: label.clone(),
        code,
    });
}

fn dispatch(
    label: &str,
    message: Value,
    pending: &PendingMap,
    on_notify: &impl Fn(&str, Value),
) {
    trace!(worker = label, %message, "rpc message");

    // Responses to our requests first.
    if let Some(id) = message.get("id").and_then(Value::as_u64) {
        if pending.complete(label, id, &message) {
            return;
        }
    }

    // Server-pushed notifications (method, no matching id).
    if let Some(method) = message.get("method").and_then(Value::as_str) {
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        on_notify(method, params);
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
