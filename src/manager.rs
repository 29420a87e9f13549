// SPDX-License-Identifier: MIT
//! The supervisor that owns every worker process.
//!
//! One `ServerManager` owns at most one worker per kind. Workers are
//! started lazily by the `get_*` accessors, keyed by a configuration
//! fingerprint: asking for a worker with the same effective config returns
//! the live instance, asking with a different config stops the old worker
//! and starts a fresh one. A per-kind lock serializes that check-then-start
//! sequence so concurrent callers cannot race two processes into existence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::join_all;
use once_cell::sync::Lazy;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cli_server::CliServerClient;
use crate::config::{
    fingerprint, CliServerConfig, LanguageServerConfig, QueryServerConfig, WorkerKind,
};
use crate::engine::EngineLocator;
use crate::error::{Result, WorkerError};
use crate::lang_server::LangServerClient;
use crate::query_server::QueryServerClient;
use crate::session::Session;

// ─── Types ────────────────────────────────────────────────────────────────────

/// Options for constructing a [`ServerManager`].
#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    /// Session id; a UUID is generated when absent.
    pub session_id: Option<String>,
    /// Root under which per-session cache trees live.
    /// Defaults to `<tmp>/codeql-cache`.
    pub cache_root: Option<PathBuf>,
    /// Where to find the `codeql` binary. Defaults to the
    /// `CODEQL_PATH` environment lookup.
    pub engine: Option<EngineLocator>,
}

/// Snapshot of one worker slot, as reported by [`ServerManager::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub fingerprint: String,
    pub running: bool,
    pub session_id: String,
}

/// A running client of any kind, held by the supervisor.
enum ManagedClient {
    Cli(Arc<CliServerClient>),
    Language(Arc<LangServerClient>),
    Query(Arc<QueryServerClient>),
}

impl ManagedClient {
    async fn is_running(&self) -> bool {
        match self {
            ManagedClient::Cli(c) => c.is_running().await,
            ManagedClient::Language(c) => c.is_running().await,
            ManagedClient::Query(c) => c.is_running().await,
        }
    }

    async fn shutdown(&self) -> Result<()> {
        match self {
            ManagedClient::Cli(c) => c.shutdown().await,
            ManagedClient::Language(c) => c.shutdown().await,
            ManagedClient::Query(c) => c.shutdown().await,
        }
    }
}

struct ManagedWorker {
    fingerprint: String,
    client: ManagedClient,
}

/// Supervisor for the CodeQL worker processes of one session.
pub struct ServerManager {
    session: Session,
    engine: EngineLocator,
    workers: Mutex<HashMap<WorkerKind, ManagedWorker>>,
    /// One lock per kind, indexed by [`WorkerKind`] discriminant order.
    /// Held across the reuse-check / stop / start sequence.
    start_locks: [Mutex<()>; 3],
}

impl ServerManager {
    /// Create a supervisor with its own session cache tree.
    pub fn new(options: ManagerOptions) -> Result<Self> {
        let cache_root = options
            .cache_root
            .unwrap_or_else(|| std::env::temp_dir().join("codeql-cache"));
        let session =
            Session::new(&cache_root, options.session_id).map_err(|source| WorkerError::Io {
                label: "session cache".to_string(),
                source,
            })?;
        let engine = match options.engine {
            Some(engine) => engine,
            None => EngineLocator::from_env()?,
        };
        info!(session_id = %session.id(), "server manager created");
        Ok(Self {
            session,
            engine,
            workers: Mutex::new(HashMap::new()),
            start_locks: [Mutex::const_new(()), Mutex::const_new(()), Mutex::const_new(())],
        })
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.session.cache_dir()
    }

    pub fn log_dir(&self) -> PathBuf {
        self.session.log_dir()
    }

    // ─── Worker accessors ─────────────────────────────────────────────────

    /// Get the CLI server for `config`, starting or restarting as needed.
    pub async fn get_cli_server(&self, config: CliServerConfig) -> Result<Arc<CliServerClient>> {
        let mut config = config;
        self.fill_session_defaults(&mut config.common_caches, &mut config.logdir);
        let print = fingerprint(WorkerKind::Cli, &config);

        let _guard = self.start_lock(WorkerKind::Cli).lock().await;
        if let Some(ManagedClient::Cli(client)) = self.reusable(WorkerKind::Cli, &print).await {
            return Ok(client);
        }
        self.stop_stale(WorkerKind::Cli).await;

        let client = Arc::new(CliServerClient::new(config, self.engine.clone()));
        client.start().await?;
        self.workers.lock().await.insert(
            WorkerKind::Cli,
            ManagedWorker {
                fingerprint: print,
                client: ManagedClient::Cli(Arc::clone(&client)),
            },
        );
        Ok(client)
    }

    /// Get the language server for `config`, starting or restarting as
    /// needed. The caller still drives `initialize()`.
    pub async fn get_language_server(
        &self,
        config: LanguageServerConfig,
    ) -> Result<Arc<LangServerClient>> {
        let mut config = config;
        self.fill_session_defaults(&mut config.common_caches, &mut config.logdir);
        let print = fingerprint(WorkerKind::Language, &config);

        let _guard = self.start_lock(WorkerKind::Language).lock().await;
        if let Some(ManagedClient::Language(client)) =
            self.reusable(WorkerKind::Language, &print).await
        {
            return Ok(client);
        }
        self.stop_stale(WorkerKind::Language).await;

        let client = Arc::new(LangServerClient::new(config, self.engine.clone()));
        client.start().await?;
        self.workers.lock().await.insert(
            WorkerKind::Language,
            ManagedWorker {
                fingerprint: print,
                client: ManagedClient::Language(Arc::clone(&client)),
            },
        );
        Ok(client)
    }

    /// Get the query server for `config`, starting or restarting as needed.
    pub async fn get_query_server(
        &self,
        config: QueryServerConfig,
    ) -> Result<Arc<QueryServerClient>> {
        let mut config = config;
        self.fill_session_defaults(&mut config.common_caches, &mut config.logdir);
        let print = fingerprint(WorkerKind::Query, &config);

        let _guard = self.start_lock(WorkerKind::Query).lock().await;
        if let Some(ManagedClient::Query(client)) = self.reusable(WorkerKind::Query, &print).await
        {
            return Ok(client);
        }
        self.stop_stale(WorkerKind::Query).await;

        let client = Arc::new(QueryServerClient::new(config, self.engine.clone()));
        client.start().await?;
        self.workers.lock().await.insert(
            WorkerKind::Query,
            ManagedWorker {
                fingerprint: print,
                client: ManagedClient::Query(Arc::clone(&client)),
            },
        );
        Ok(client)
    }

    // ─── Warm-up ──────────────────────────────────────────────────────────

    /// Start the CLI server ahead of first use and prime it with a cheap
    /// command. Failures are logged, never surfaced.
    pub async fn warm_up_cli_server(&self) {
        match self.get_cli_server(CliServerConfig::default()).await {
            Ok(client) => {
                if let Err(err) = client
                    .run_command(vec!["resolve".to_string(), "languages".to_string()])
                    .await
                {
                    warn!(%err, "CLI server warm-up command failed");
                }
            }
            Err(err) => warn!(%err, "CLI server warm-up failed"),
        }
    }

    /// Start and initialize the language server ahead of first use.
    /// Failures are logged, never surfaced.
    pub async fn warm_up_language_server(&self, search_path: Option<String>) {
        let config = LanguageServerConfig {
            search_path,
            ..LanguageServerConfig::default()
        };
        match self.get_language_server(config).await {
            Ok(client) => {
                if let Err(err) = client.initialize(None).await {
                    warn!(%err, "language server warm-up initialize failed");
                }
            }
            Err(err) => warn!(%err, "language server warm-up failed"),
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────

    /// Stop the worker of one kind, if any. Shutdown errors are logged.
    pub async fn shutdown_one(&self, kind: WorkerKind) {
        let _guard = self.start_lock(kind).lock().await;
        if let Some(worker) = self.workers.lock().await.remove(&kind) {
            if let Err(err) = worker.client.shutdown().await {
                warn!(kind = kind.as_str(), %err, "worker shutdown failed");
            }
        }
    }

    /// Stop every worker concurrently and clear the slots.
    pub async fn shutdown_all(&self) {
        info!(session_id = %self.session.id(), "shutting down all workers");
        let workers: Vec<ManagedWorker> = {
            let mut map = self.workers.lock().await;
            WorkerKind::ALL
                .iter()
                .filter_map(|kind| map.remove(kind))
                .collect()
        };
        let shutdowns = workers.iter().map(|worker| worker.client.shutdown());
        for (worker, outcome) in workers.iter().zip(join_all(shutdowns).await) {
            if let Err(err) = outcome {
                warn!(fingerprint = %worker.fingerprint, %err, "worker shutdown failed");
            }
        }
    }

    /// Snapshot every worker slot. Kinds that never started map to `None`.
    pub async fn status(&self) -> HashMap<WorkerKind, Option<WorkerStatus>> {
        let map = self.workers.lock().await;
        let mut out = HashMap::new();
        for kind in WorkerKind::ALL {
            let status = match map.get(&kind) {
                None => None,
                Some(worker) => Some(WorkerStatus {
                    fingerprint: worker.fingerprint.clone(),
                    running: worker.client.is_running().await,
                    session_id: self.session.id().to_string(),
                }),
            };
            out.insert(kind, status);
        }
        out
    }

    // ─── Internals ────────────────────────────────────────────────────────

    fn start_lock(&self, kind: WorkerKind) -> &Mutex<()> {
        let index = match kind {
            WorkerKind::Cli => 0,
            WorkerKind::Language => 1,
            WorkerKind::Query => 2,
        };
        &self.start_locks[index]
    }

    /// Default `common_caches` and `logdir` into this session's tree when
    /// the caller left them unset, so the fingerprint reflects the paths
    /// the worker will actually run with.
    fn fill_session_defaults(
        &self,
        common_caches: &mut Option<String>,
        logdir: &mut Option<String>,
    ) {
        if common_caches.is_none() {
            *common_caches = Some(self.session.cache_dir().display().to_string());
        }
        if logdir.is_none() {
            *logdir = Some(self.session.log_dir().display().to_string());
        }
    }

    /// The live client for `kind` when its fingerprint matches and the
    /// process is still up.
    async fn reusable(&self, kind: WorkerKind, print: &str) -> Option<ManagedClient> {
        let map = self.workers.lock().await;
        let worker = map.get(&kind)?;
        if worker.fingerprint != print || !worker.client.is_running().await {
            return None;
        }
        Some(match &worker.client {
            ManagedClient::Cli(c) => ManagedClient::Cli(Arc::clone(c)),
            ManagedClient::Language(c) => ManagedClient::Language(Arc::clone(c)),
            ManagedClient::Query(c) => ManagedClient::Query(Arc::clone(c)),
        })
    }

    /// Remove and stop whatever occupies the slot for `kind`. Stop errors
    /// never block the replacement from starting.
    async fn stop_stale(&self, kind: WorkerKind) {
        if let Some(worker) = self.workers.lock().await.remove(&kind) {
            info!(kind = kind.as_str(), "stopping worker before restart");
            if let Err(err) = worker.client.shutdown().await {
                warn!(kind = kind.as_str(), %err, "stale worker shutdown failed");
            }
        }
    }
}

// ─── Global singleton ─────────────────────────────────────────────────────────

static GLOBAL: Lazy<std::sync::Mutex<Option<Arc<ServerManager>>>> =
    Lazy::new(|| std::sync::Mutex::new(None));

fn global_slot() -> std::sync::MutexGuard<'static, Option<Arc<ServerManager>>> {
    // A poisoned slot only means another thread panicked mid-update; the
    // Option inside is still usable.
    GLOBAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Install the process-wide manager. Fails if one is already installed.
pub fn init_global(options: ManagerOptions) -> Result<Arc<ServerManager>> {
    let mut slot = global_slot();
    if slot.is_some() {
        return Err(WorkerError::AlreadyRunning {
            label: "global server manager".to_string(),
        });
    }
    let manager = Arc::new(ServerManager::new(options)?);
    *slot = Some(Arc::clone(&manager));
    Ok(manager)
}

/// The process-wide manager, if one was installed.
pub fn global() -> Result<Arc<ServerManager>> {
    global_slot().clone().ok_or(WorkerError::NotInitialized)
}

/// Uninstall the process-wide manager and stop its workers.
pub async fn shutdown_global() {
    let manager = global_slot().take();
    if let Some(manager) = manager {
        manager.shutdown_all().await;
    }
}

/// Drop the process-wide manager without stopping workers. Test hook.
pub fn reset_global() {
    global_slot().take();
}
