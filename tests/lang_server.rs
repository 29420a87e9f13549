#![cfg(unix)]
//! End-to-end tests for the language server client against a scripted peer.

mod common;

use quarry::{
    LangServerClient, LanguageServerConfig, Position, TextDocumentIdentifier,
    TextDocumentPositionParams, WorkerError,
};

fn client() -> LangServerClient {
    LangServerClient::new(
        LanguageServerConfig::default(),
        common::fixture_engine("lsp-server.sh"),
    )
}

fn at(uri: &str, line: u32, character: u32) -> TextDocumentPositionParams {
    TextDocumentPositionParams {
        text_document: TextDocumentIdentifier {
            uri: uri.to_string(),
        },
        position: Position { line, character },
    }
}

#[tokio::test]
async fn initialize_and_navigate() {
    let client = client();
    client.start().await.unwrap();
    client
        .initialize(Some("file:///workspace".to_string()))
        .await
        .unwrap();

    client
        .open_document("file:///workspace/q.ql", "import cpp\nselect 1")
        .await
        .unwrap();

    let completions = client
        .get_completions(at("file:///workspace/q.ql", 1, 0))
        .await
        .unwrap();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].label, "Expr");

    let definitions = client
        .get_definition(at("file:///workspace/q.ql", 0, 7))
        .await
        .unwrap();
    assert_eq!(definitions.len(), 1);
    assert_eq!(definitions[0].uri, "file:///lib.qll");
    assert_eq!(definitions[0].range.start.line, 3);

    let references = client
        .get_references(at("file:///workspace/q.ql", 0, 7))
        .await
        .unwrap();
    assert!(references.is_empty());

    client.close_document("file:///workspace/q.ql").await.unwrap();
    client.shutdown().await.unwrap();
    assert!(!client.is_running().await);
}

#[tokio::test]
async fn evaluate_returns_diagnostics_for_the_snippet() {
    let client = client();
    client.start().await.unwrap();
    client.initialize(None).await.unwrap();

    let diagnostics = client.evaluate("select 1", None).await.unwrap();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].severity, Some(1));
    assert!(diagnostics[0].message.starts_with("checked file://"));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_evaluations_stay_isolated() {
    let client = client();
    client.start().await.unwrap();
    client.initialize(None).await.unwrap();

    let uri_a = "file:///tmp/eval-a.ql".to_string();
    let uri_b = "file:///tmp/eval-b.ql".to_string();
    let (a, b) = tokio::join!(
        client.evaluate("select 1", Some(uri_a.clone())),
        client.evaluate("select 2", Some(uri_b.clone())),
    );

    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a[0].message, format!("checked {uri_a}"));
    assert_eq!(b[0].message, format!("checked {uri_b}"));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn evaluate_requires_initialize() {
    let client = client();
    client.start().await.unwrap();

    let err = client.evaluate("select 1", None).await.unwrap_err();
    assert!(matches!(err, WorkerError::NotInitialized));

    client.shutdown().await.unwrap();
}
