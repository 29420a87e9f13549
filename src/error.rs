// SPDX-License-Identifier: MIT
//! Error taxonomy for worker processes and their protocol clients.
//!
//! Every failure names the worker it came from and the underlying cause
//! (exit code, timeout duration, method name). Misuse errors (calling an
//! operation on a client that is not running or not initialized) are
//! returned synchronously, before any I/O is attempted.

/// Errors produced by worker clients and the server manager.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The worker process could not be spawned at all.
    #[error("{label} failed to start: {source}")]
    Spawn {
        label: String,
        #[source]
        source: std::io::Error,
    },

    /// The worker exited (or was killed) while work was outstanding.
    #[error("{label} exited unexpectedly (code: {code:?})")]
    Exited { label: String, code: Option<i32> },

    /// The worker died before emitting any output.
    #[error("{label} exited before becoming ready (code: {code:?})")]
    NotReady { label: String, code: Option<i32> },

    /// The worker returned an error object or a malformed response.
    #[error("{label} protocol error: {message}")]
    Protocol { label: String, message: String },

    /// No response arrived within the bound for this operation.
    #[error("{label} request timed out after {ms} ms (method: {method})")]
    Timeout {
        label: String,
        method: String,
        ms: u64,
    },

    /// Operation attempted on a client whose process is not running.
    #[error("{label} is not running")]
    NotRunning { label: String },

    /// `start()` called while the process is already live.
    #[error("{label} is already running")]
    AlreadyRunning { label: String },

    /// LSP operation attempted before `initialize()` completed.
    #[error("language server is not initialized")]
    NotInitialized,

    /// I/O failure on the worker's stdin.
    #[error("{label} write failed: {source}")]
    Io {
        label: String,
        #[source]
        source: std::io::Error,
    },

    /// The engine installation could not be resolved from the environment.
    #[error("invalid engine path: {0}")]
    EnginePath(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
