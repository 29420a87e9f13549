// SPDX-License-Identifier: MIT
//! Supervisor and protocol clients for CodeQL worker processes.
//!
//! CodeQL ships long-lived server modes (`codeql execute cli-server`,
//! `language-server`, `query-server2`) that amortize JVM startup across
//! many requests. This crate spawns those processes, speaks their wire
//! protocols, and supervises their lifecycle:
//!
//! - [`cli_server::CliServerClient`]: NUL-delimited command queue, one
//!   command in flight at a time.
//! - [`lang_server::LangServerClient`]: LSP-style JSON-RPC for QL
//!   validation, completion, and navigation.
//! - [`query_server::QueryServerClient`]: JSON-RPC evaluation protocol
//!   for compiling and running queries.
//! - [`manager::ServerManager`]: at most one worker per kind, reused
//!   while the configuration fingerprint matches, restarted when it
//!   changes; caches scoped to a session directory tree.
//!
//! The `codeql` binary is located through the `CODEQL_PATH` environment
//! variable (see [`engine::EngineLocator`]) or plain `PATH` lookup.

pub mod cli_server;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod lang_server;
pub mod manager;
pub mod process;
pub mod query_server;
pub mod ready;
pub mod rpc;
pub mod session;

pub use cli_server::CliServerClient;
pub use config::{
    fingerprint, CheckErrors, CliServerConfig, LanguageServerConfig, LogLevel, QueryServerConfig,
    Verbosity, WorkerKind,
};
pub use engine::{EngineLocator, ENGINE_PATH_VAR};
pub use error::{Result, WorkerError};
pub use lang_server::{
    Diagnostic, LangServerClient, LspLocation, Position, PublishDiagnosticsParams, Range,
    TextDocumentIdentifier, TextDocumentPositionParams,
};
pub use manager::{
    global, init_global, reset_global, shutdown_global, ManagerOptions, ServerManager,
    WorkerStatus,
};
pub use query_server::QueryServerClient;
pub use rpc::Notification;
pub use session::Session;
