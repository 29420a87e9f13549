// SPDX-License-Identifier: MIT
//! Configuration for CodeQL background server processes.
//!
//! CodeQL exposes three background server modes:
//! 1. `cli-server`: JVM reuse for CLI commands (NUL-delimited protocol)
//! 2. `language-server`: LSP-based QL validation (JSON-RPC over stdio)
//! 3. `query-server2`: query evaluation (JSON-RPC over stdio)
//!
//! Each mode has its own configuration shape, sharing the search-path /
//! cache-directory / log-directory trio. A configuration's identity is its
//! fingerprint: a SHA-256 digest over the canonical (key-sorted) JSON of the
//! config combined with the worker kind. The supervisor compares
//! fingerprints to decide whether a live worker can be reused or must be
//! restarted.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

// ─── WorkerKind ───────────────────────────────────────────────────────────────

/// The three background server kinds. At most one live worker per kind is
/// permitted within a [`ServerManager`](crate::manager::ServerManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Cli,
    Language,
    Query,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 3] = [WorkerKind::Cli, WorkerKind::Language, WorkerKind::Query];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Cli => "cli",
            WorkerKind::Language => "language",
            WorkerKind::Query => "query",
        }
    }

    /// Human-readable label used in log lines and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            WorkerKind::Cli => "CodeQL CLI Server",
            WorkerKind::Language => "CodeQL Language Server",
            WorkerKind::Query => "CodeQL Query Server",
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Per-kind configuration ───────────────────────────────────────────────────

/// Error checking mode for the language server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckErrors {
    Explicit,
    #[default]
    OnChange,
}

impl CheckErrors {
    fn as_str(&self) -> &'static str {
        match self {
            CheckErrors::Explicit => "EXPLICIT",
            CheckErrors::OnChange => "ON_CHANGE",
        }
    }
}

/// Log level accepted by the language server's `--loglevel` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
    All,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "OFF",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
            LogLevel::All => "ALL",
        }
    }
}

/// Progress verbosity for the language server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Errors,
    Warnings,
    Progress,
    #[serde(rename = "progress+")]
    ProgressPlus,
    #[serde(rename = "progress++")]
    ProgressPlusPlus,
    #[serde(rename = "progress+++")]
    ProgressPlusPlusPlus,
}

impl Verbosity {
    fn as_str(&self) -> &'static str {
        match self {
            Verbosity::Errors => "errors",
            Verbosity::Warnings => "warnings",
            Verbosity::Progress => "progress",
            Verbosity::ProgressPlus => "progress+",
            Verbosity::ProgressPlusPlus => "progress++",
            Verbosity::ProgressPlusPlusPlus => "progress+++",
        }
    }
}

/// Configuration for the CLI server. The cli-server mode has few options;
/// just the shared cache and log locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct CliServerConfig {
    /// Path to QL packs (`--search-path`).
    pub search_path: Option<String>,
    /// Location for cached data (`--common-caches`).
    pub common_caches: Option<String>,
    /// Directory for detailed logs (`--logdir`).
    pub logdir: Option<String>,
}

/// Configuration for the language server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct LanguageServerConfig {
    pub search_path: Option<String>,
    pub common_caches: Option<String>,
    pub logdir: Option<String>,
    /// Error checking mode. Default: ON_CHANGE.
    pub check_errors: CheckErrors,
    pub loglevel: Option<LogLevel>,
    /// Single-threaded execution.
    pub synchronous: bool,
    pub verbosity: Option<Verbosity>,
}

/// Configuration for the query server (`query-server2`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryServerConfig {
    pub search_path: Option<String>,
    pub common_caches: Option<String>,
    pub logdir: Option<String>,
    /// Thread count. 0 = one per core, -N = leave N cores free.
    pub threads: Option<i32>,
    /// Query evaluation timeout in seconds.
    pub timeout: Option<u32>,
    /// Maximum disk cache size in MB for intermediate results.
    pub max_disk_cache: Option<u64>,
    /// Path for structured evaluator performance logs.
    pub evaluator_log: Option<String>,
    /// Include tuple counts in evaluation logs.
    pub tuple_counting: bool,
    /// Debug mode; implies tuple counting.
    pub debug: bool,
}

// ─── Fingerprinting ───────────────────────────────────────────────────────────

/// Compute the fingerprint of a worker configuration.
///
/// The digest covers the canonical JSON of `{config, kind}`: every object
/// level is serialized with keys in lexicographic order, so two semantically
/// identical configs fingerprint identically regardless of field order, and
/// the kind tag keeps equal configs of different kinds apart.
pub fn fingerprint<C: Serialize>(kind: WorkerKind, config: &C) -> String {
    let value = serde_json::json!({
        "config": serde_json::to_value(config).unwrap_or(Value::Null),
        "kind": kind.as_str(),
    });
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Serialize a JSON value deterministically, sorting object keys at every
/// nesting level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

// ─── Argument building ────────────────────────────────────────────────────────

/// Build argv for `codeql execute cli-server`.
pub fn build_cli_server_args(config: &CliServerConfig) -> Vec<String> {
    let mut args = vec!["execute".to_string(), "cli-server".to_string()];
    if let Some(caches) = &config.common_caches {
        args.push(format!("--common-caches={caches}"));
    }
    if let Some(logdir) = &config.logdir {
        args.push(format!("--logdir={logdir}"));
    }
    args
}

/// Build argv for `codeql execute language-server`.
pub fn build_language_server_args(config: &LanguageServerConfig) -> Vec<String> {
    let mut args = vec![
        "execute".to_string(),
        "language-server".to_string(),
        format!("--check-errors={}", config.check_errors.as_str()),
    ];
    if let Some(path) = &config.search_path {
        args.push(format!("--search-path={path}"));
    }
    if let Some(caches) = &config.common_caches {
        args.push(format!("--common-caches={caches}"));
    }
    if let Some(logdir) = &config.logdir {
        args.push(format!("--logdir={logdir}"));
    }
    if let Some(level) = config.loglevel {
        args.push(format!("--loglevel={}", level.as_str()));
    }
    if config.synchronous {
        args.push("--synchronous".to_string());
    }
    if let Some(verbosity) = config.verbosity {
        args.push(format!("--verbosity={}", verbosity.as_str()));
    }
    args
}

/// Build argv for `codeql execute query-server2`.
///
/// `debug` implies `--tuple-counting`; the flag is emitted at most once even
/// when `tuple_counting` is also set.
pub fn build_query_server_args(config: &QueryServerConfig) -> Vec<String> {
    let mut args = vec!["execute".to_string(), "query-server2".to_string()];
    if let Some(path) = &config.search_path {
        args.push(format!("--search-path={path}"));
    }
    if let Some(caches) = &config.common_caches {
        args.push(format!("--common-caches={caches}"));
    }
    if let Some(logdir) = &config.logdir {
        args.push(format!("--logdir={logdir}"));
    }
    if let Some(threads) = config.threads {
        args.push(format!("--threads={threads}"));
    }
    if let Some(timeout) = config.timeout {
        args.push(format!("--timeout={timeout}"));
    }
    if let Some(cache) = config.max_disk_cache {
        args.push(format!("--max-disk-cache={cache}"));
    }
    if let Some(log) = &config.evaluator_log {
        args.push(format!("--evaluator-log={log}"));
    }
    if config.debug {
        args.push("--debug".to_string());
        args.push("--tuple-counting".to_string());
    } else if config.tuple_counting {
        args.push("--tuple-counting".to_string());
    }
    args
}

// ─── Tests ────────────────────────────────────────────────────────────────────
