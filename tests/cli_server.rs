#![cfg(unix)]
//! End-to-end tests for the CLI server client against a scripted worker.

mod common;

use std::sync::Arc;

use quarry::{CliServerClient, CliServerConfig, WorkerError};

fn client(fixture: &str) -> CliServerClient {
    CliServerClient::new(CliServerConfig::default(), common::fixture_engine(fixture))
}

#[tokio::test]
async fn command_round_trip() {
    let client = client("cli-server.sh");
    client.start().await.unwrap();

    let out = client
        .run_command(vec!["resolve".to_string(), "qlpacks".to_string()])
        .await
        .unwrap();
    assert_eq!(out, r#"{"result":"ok"}"#);

    client.shutdown().await.unwrap();
    assert!(!client.is_running().await);
}

#[tokio::test]
async fn replies_pair_with_their_commands() {
    let client = Arc::new(client("cli-server.sh"));
    client.start().await.unwrap();

    // Commands race into the queue; each reply must still echo the command
    // it belongs to.
    let mut tasks = Vec::new();
    for i in 0..5 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            let marker = format!("task-{i}");
            let reply = client
                .run_command(vec!["echo".to_string(), marker.clone()])
                .await
                .unwrap();
            assert!(reply.contains(&marker), "mispaired reply: {reply}");
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn worker_exit_rejects_pending_command() {
    let client = client("cli-silent.sh");
    client.start().await.unwrap();

    let err = client
        .run_command(vec!["resolve".to_string(), "languages".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Exited { .. }), "got: {err}");

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn double_start_is_rejected() {
    let client = client("cli-server.sh");
    client.start().await.unwrap();

    let err = client.start().await.unwrap_err();
    assert!(matches!(err, WorkerError::AlreadyRunning { .. }));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn command_before_start_fails() {
    let client = client("cli-server.sh");
    let err = client
        .run_command(vec!["version".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::NotRunning { .. }));
}
