#![cfg(unix)]
//! Handshake accounting for the language server client, isolated in its own
//! binary because the scripted peer logs traffic through an environment
//! variable inherited at spawn time.

mod common;

use quarry::{LangServerClient, LanguageServerConfig};

#[tokio::test]
async fn repeat_initialize_is_one_handshake_and_one_retarget() {
    let log = tempfile::NamedTempFile::new().unwrap();
    std::env::set_var("LSP_FIXTURE_LOG", log.path());

    let client = LangServerClient::new(
        LanguageServerConfig::default(),
        common::fixture_engine("lsp-server.sh"),
    );
    client.start().await.unwrap();

    client
        .initialize(Some("file:///ws-a".to_string()))
        .await
        .unwrap();
    // Same workspace again: must not touch the wire.
    client
        .initialize(Some("file:///ws-a".to_string()))
        .await
        .unwrap();
    // New workspace: a folder-change notification, not a second handshake.
    client
        .initialize(Some("file:///ws-b".to_string()))
        .await
        .unwrap();

    client.shutdown().await.unwrap();
    std::env::remove_var("LSP_FIXTURE_LOG");

    let traffic = std::fs::read_to_string(log.path()).unwrap();
    let count = |method: &str| traffic.lines().filter(|line| *line == method).count();
    assert_eq!(count("initialize"), 1, "traffic:\n{traffic}");
    assert_eq!(count("initialized"), 1);
    assert_eq!(count("workspace/didChangeWorkspaceFolders"), 1);
}
