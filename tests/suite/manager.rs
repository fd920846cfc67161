//! Orchestration across sessions: routing, timeouts, aggregation, cleanup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bridge_lsp::{LspConfig, LspError, LspManager, Session, SessionState};
use serde_json::{Value, json};
use tokio::time;

use crate::common::{
    FakeServer, barrier, file_uri, ready_session, test_config, wire_diagnostic, workspace_root,
};

fn manager(request_timeout: Duration) -> LspManager {
    LspManager::new(LspConfig::default().with_request_timeout(request_timeout))
}

async fn ready(name: &str, extension: &str) -> (Arc<Session>, FakeServer) {
    let config = test_config().with_file_extensions(vec![extension.to_string()]);
    let (session, server) = ready_session(name, config).await;
    (Arc::new(session), server)
}

/// Answer the shutdown handshake and wait for the client to hang up.
async fn accept_shutdown(server: &mut FakeServer) {
    let request = server.expect_request("shutdown").await;
    server.reply(request.id, Value::Null).await;
    server.expect_notification("exit").await;
    assert!(server.recv().await.is_none());
}

#[tokio::test]
async fn test_file_changes_route_by_extension_and_root() {
    let mut manager = manager(Duration::from_secs(5));
    let (session, mut server) = ready("fake", "txt").await;
    assert!(manager.insert_session(Arc::clone(&session)).is_none());
    assert!(manager.has_running_sessions());

    let root = workspace_root();
    assert!(manager.on_file_changed(&root.join("src/a.txt"), "one").await.unwrap());
    assert!(manager.on_file_changed(&root.join("src/a.txt"), "two").await.unwrap());
    // Same document, reached through a dotted path.
    assert!(
        manager
            .on_file_changed(&root.join("src/../src/a.txt"), "three")
            .await
            .unwrap()
    );

    let uri = file_uri("src/a.txt");
    let open = server.expect_notification("textDocument/didOpen").await;
    let params = open.params.unwrap();
    assert_eq!(params["textDocument"]["uri"], uri.as_str());
    assert_eq!(params["textDocument"]["version"], 1);
    for (version, text) in [(2, "two"), (3, "three")] {
        let change = server.expect_notification("textDocument/didChange").await;
        let params = change.params.unwrap();
        assert_eq!(params["textDocument"]["version"], version);
        assert_eq!(params["contentChanges"][0]["text"], text);
    }

    assert!(!manager.on_file_changed(&root.join("a.rs"), "fn main() {}").await.unwrap());
    assert!(!manager.on_file_changed(Path::new("/elsewhere/a.txt"), "x").await.unwrap());
    assert!(!manager.on_file_changed(&root.join("Makefile"), "all:").await.unwrap());
    barrier(&session, &mut server).await;
}

#[tokio::test]
async fn test_request_timeout_evicts_and_session_stays_usable() {
    let mut manager = manager(Duration::from_millis(200));
    let (session, mut server) = ready("fake", "txt").await;
    manager.insert_session(Arc::clone(&session));
    let uri = file_uri("slow.txt");

    let script = async { server.expect_request("textDocument/hover").await };
    let (hover, late) = tokio::join!(manager.hover("fake", &uri, 0, 0), script);

    let err = hover.unwrap_err();
    assert!(matches!(
        err,
        LspError::Timeout { ref method, .. } if method == "textDocument/hover"
    ));
    assert_eq!(session.pending_requests(), 0);
    assert_eq!(session.state(), SessionState::Ready);

    // A late reply for the abandoned id is discarded.
    server.reply(late.id, json!({ "contents": "late" })).await;

    let script = async {
        let request = server.expect_request("custom/ping").await;
        server.reply(request.id, json!("pong")).await;
    };
    let (pong, ()) = tokio::join!(manager.request("fake", "custom/ping", None), script);
    assert_eq!(pong.unwrap(), json!("pong"));

    let script = async {
        let request = server.expect_request("workspace/executeCommand").await;
        assert_eq!(request.params.clone().unwrap()["command"], "compile");
        server.reply(request.id, json!({ "ok": true })).await;
    };
    let (executed, ()) = tokio::join!(manager.execute("fake", "compile", Vec::new()), script);
    assert_eq!(executed.unwrap(), json!({ "ok": true }));
}

#[tokio::test]
async fn test_diagnostics_aggregate_across_sessions() {
    let mut manager = manager(Duration::from_secs(5));
    let (alpha, mut alpha_server) = ready("alpha", "txt").await;
    let (beta, mut beta_server) = ready("beta", "md").await;
    manager.insert_session(Arc::clone(&alpha));
    manager.insert_session(Arc::clone(&beta));
    assert_eq!(manager.session_names(), ["alpha", "beta"]);

    let notes = file_uri("notes.txt");
    let readme = file_uri("README.md");
    alpha_server
        .publish_diagnostics(&notes, json!([wire_diagnostic(3, 2, "unused")]))
        .await;
    beta_server
        .publish_diagnostics(
            &readme,
            json!([wire_diagnostic(0, 1, "broken link"), wire_diagnostic(9, 4, "style")]),
        )
        .await;
    // Both servers may report on the same document.
    beta_server
        .publish_diagnostics(&notes, json!([wire_diagnostic(7, 1, "bad heading")]))
        .await;
    barrier(&alpha, &mut alpha_server).await;
    barrier(&beta, &mut beta_server).await;

    let all = manager.diagnostics(None);
    assert_eq!(all.documents().len(), 2);
    assert_eq!(all.error_count(), 2);
    assert_eq!(all.warning_count(), 1);
    assert_eq!(all.hint_count(), 1);
    assert_eq!(all.entries(&notes).len(), 2);

    let one = manager.diagnostics(Some(&readme));
    assert_eq!(one.documents().len(), 1);
    assert_eq!(one.total_count(), 2);

    let root = workspace_root();
    let clean = root.join("clean.txt");
    let errors = manager.errors_for_files(&[root.join("notes.txt"), root.join("README.md"), clean]);
    assert_eq!(errors.len(), 2);
    let (path, entries) = &errors[0];
    assert_eq!(path, &root.join("notes.txt"));
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message(), "bad heading");
    assert_eq!(errors[1].1[0].message(), "broken link");
}

#[tokio::test]
async fn test_dead_sessions_are_removed() {
    let mut manager = manager(Duration::from_secs(5));
    let (alive, mut alive_server) = ready("alive", "txt").await;
    let (dying, dying_server) = ready("dying", "md").await;
    manager.insert_session(Arc::clone(&alive));
    manager.insert_session(Arc::clone(&dying));

    let mut states = dying.subscribe_state();
    drop(dying_server);
    time::timeout(
        Duration::from_secs(5),
        states.wait_for(|state| state.is_terminal()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(manager.remove_dead_sessions(), ["dying"]);
    assert_eq!(manager.session_names(), ["alive"]);
    assert!(matches!(
        manager.session("dying"),
        Err(LspError::UnknownSession { .. })
    ));
    assert!(manager.has_running_sessions());
    assert!(manager.remove_dead_sessions().is_empty());

    let script = accept_shutdown(&mut alive_server);
    tokio::join!(manager.shutdown_all(), script);
    assert!(manager.session_names().is_empty());
    assert!(!manager.has_running_sessions());
    assert_eq!(alive.state(), SessionState::Terminated);
}

#[tokio::test]
async fn test_shutdown_all_stops_every_session() {
    let mut manager = manager(Duration::from_secs(5));
    let (alpha, mut alpha_server) = ready("alpha", "txt").await;
    let (beta, mut beta_server) = ready("beta", "md").await;
    manager.insert_session(Arc::clone(&alpha));
    manager.insert_session(Arc::clone(&beta));

    tokio::join!(
        manager.shutdown_all(),
        accept_shutdown(&mut alpha_server),
        accept_shutdown(&mut beta_server),
    );

    assert_eq!(alpha.state(), SessionState::Terminated);
    assert_eq!(beta.state(), SessionState::Terminated);
    assert!(manager.session_names().is_empty());
    assert!(matches!(
        manager.hover("alpha", &file_uri("a.txt"), 0, 0).await,
        Err(LspError::UnknownSession { .. })
    ));

    // Nothing left to stop.
    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_errors_for_files_keeps_caller_paths() {
    let mut manager = manager(Duration::from_secs(5));
    let (session, mut server) = ready("fake", "txt").await;
    manager.insert_session(Arc::clone(&session));

    server
        .publish_diagnostics(&file_uri("lib/a.txt"), json!([wire_diagnostic(1, 1, "boom")]))
        .await;
    barrier(&session, &mut server).await;

    let dotted: PathBuf = workspace_root().join("lib/../lib/a.txt");
    let errors = manager.errors_for_files(&[dotted.clone()]);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, dotted);
    assert_eq!(errors[0].1[0].line(), 1);
}
