#![cfg(unix)]
//! Supervisor behavior: fingerprint-keyed reuse, restart on config change,
//! session scoping, and the global singleton lifecycle.

mod common;

use std::sync::Arc;

use quarry::{
    global, init_global, shutdown_global, CliServerConfig, LanguageServerConfig, ManagerOptions,
    ServerManager, WorkerError, WorkerKind,
};

fn manager(tmp: &tempfile::TempDir) -> ServerManager {
    ServerManager::new(ManagerOptions {
        session_id: None,
        cache_root: Some(tmp.path().to_path_buf()),
        engine: Some(common::fixture_engine("cli-server.sh")),
    })
    .unwrap()
}

#[tokio::test]
async fn same_config_reuses_the_running_worker() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(&tmp);

    let first = manager.get_cli_server(CliServerConfig::default()).await.unwrap();
    let second = manager.get_cli_server(CliServerConfig::default()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    manager.shutdown_all().await;
}

#[tokio::test]
async fn changed_config_restarts_the_worker() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(&tmp);

    let first = manager.get_cli_server(CliServerConfig::default()).await.unwrap();
    let second = manager
        .get_cli_server(CliServerConfig {
            search_path: Some("/opt/ql-packs".to_string()),
            ..CliServerConfig::default()
        })
        .await
        .unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert!(!first.is_running().await, "stale worker must be stopped");
    assert!(second.is_running().await);

    manager.shutdown_all().await;
}

#[tokio::test]
async fn concurrent_gets_share_one_worker() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = Arc::new(manager(&tmp));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let manager = Arc::clone(&manager);
        tasks.push(tokio::spawn(async move {
            manager.get_cli_server(CliServerConfig::default()).await.unwrap()
        }));
    }

    let mut clients = Vec::new();
    for task in tasks {
        clients.push(task.await.unwrap());
    }
    for client in &clients[1..] {
        assert!(Arc::ptr_eq(&clients[0], client), "only one worker may start");
    }

    manager.shutdown_all().await;
}

#[tokio::test]
async fn session_cache_dir_is_the_session_root() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = ServerManager::new(ManagerOptions {
        session_id: Some("s1".to_string()),
        cache_root: Some(tmp.path().to_path_buf()),
        engine: Some(common::fixture_engine("cli-server.sh")),
    })
    .unwrap();

    assert_eq!(manager.cache_dir(), tmp.path().join("s1"));
    for subdir in ["compilation-cache", "logs", "query-cache"] {
        assert!(
            manager.cache_dir().join(subdir).is_dir(),
            "missing session subdir {subdir}"
        );
    }
}

#[tokio::test]
async fn status_tracks_live_and_stopped_workers() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(&tmp);

    let status = manager.status().await;
    assert!(status[&WorkerKind::Cli].is_none());

    manager.get_cli_server(CliServerConfig::default()).await.unwrap();
    let status = manager.status().await;
    let cli = status[&WorkerKind::Cli].as_ref().unwrap();
    assert!(cli.running);
    assert_eq!(cli.session_id, manager.session_id());
    assert!(status[&WorkerKind::Query].is_none());

    manager.shutdown_all().await;
    let status = manager.status().await;
    assert!(status[&WorkerKind::Cli].is_none());
}

#[tokio::test]
async fn shutdown_one_only_clears_that_kind() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(&tmp);

    let cli = manager.get_cli_server(CliServerConfig::default()).await.unwrap();
    manager.shutdown_one(WorkerKind::Cli).await;
    assert!(!cli.is_running().await);
    assert!(manager.status().await[&WorkerKind::Cli].is_none());
}

#[tokio::test]
async fn language_server_reuse_goes_through_the_manager() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = ServerManager::new(ManagerOptions {
        session_id: None,
        cache_root: Some(tmp.path().to_path_buf()),
        engine: Some(common::fixture_engine("lsp-server.sh")),
    })
    .unwrap();

    let first = manager
        .get_language_server(LanguageServerConfig::default())
        .await
        .unwrap();
    first.initialize(None).await.unwrap();
    let second = manager
        .get_language_server(LanguageServerConfig::default())
        .await
        .unwrap();

    // The reused client keeps its handshake.
    assert!(Arc::ptr_eq(&first, &second));
    second.initialize(None).await.unwrap();

    manager.shutdown_all().await;
}

#[tokio::test]
async fn global_singleton_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();
    let options = ManagerOptions {
        session_id: Some("global-session".to_string()),
        cache_root: Some(tmp.path().to_path_buf()),
        engine: Some(common::fixture_engine("cli-server.sh")),
    };

    let installed = init_global(options.clone()).unwrap();
    assert!(Arc::ptr_eq(&installed, &global().unwrap()));

    // A second install must be refused while the first is live.
    assert!(matches!(
        init_global(options),
        Err(WorkerError::AlreadyRunning { .. })
    ));

    shutdown_global().await;
    assert!(matches!(global(), Err(WorkerError::NotInitialized)));
}
