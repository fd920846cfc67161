//! Session lifecycle: handshake, failure paths and shutdown.

use std::process;
use std::time::Duration;

use bridge_lsp::protocol::{self, Message, RequestId, ResponseError};
use bridge_lsp::{LspError, Session, SessionState};
use serde_json::{Value, json};
use tokio::time::{self, Instant};

use crate::common::{file_uri, pipe, ready_session, test_config, workspace_root};

#[tokio::test]
async fn test_handshake_sends_initialize_then_initialized() {
    let (reader, writer, mut server) = pipe();
    let session = Session::new("fake", test_config());
    assert_eq!(session.state(), SessionState::NotStarted);

    let script = async {
        let init = server.expect_request("initialize").await;
        // The reader is up and the request is in flight.
        assert_eq!(session.state(), SessionState::Initializing);
        let err = session
            .notify_open(&file_uri("a.txt"), "plaintext", "a")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LspError::SessionState {
                state: SessionState::Initializing,
                ..
            }
        ));

        server
            .reply(init.id.clone(), json!({ "capabilities": {} }))
            .await;
        server.expect_notification("initialized").await;
        init
    };
    let (started, init) = tokio::join!(session.connect(reader, writer), script);
    started.unwrap();

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(init.id, RequestId::Integer(1));
    let params = init.params.unwrap();
    let root_uri = protocol::path_to_file_uri(&workspace_root()).unwrap();
    assert_eq!(params["rootUri"], root_uri.as_str());
    assert_eq!(params["processId"], process::id());
    assert_eq!(params["workspaceFolders"][0]["uri"], root_uri.as_str());
    assert_eq!(params["workspaceFolders"][0]["name"], "project");
    assert_eq!(
        params["capabilities"]["textDocument"]["synchronization"]["didSave"],
        true
    );

    // Settle delay is zero in tests.
    time::timeout(Duration::from_secs(1), session.settled())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let (session, _server) = ready_session("fake", test_config()).await;
    let (reader, writer, _other) = pipe();
    let err = session.connect(reader, writer).await.unwrap_err();
    assert!(matches!(
        err,
        LspError::SessionState {
            operation: "connect",
            state: SessionState::Ready
        }
    ));
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_initialize_error_fails_session() {
    let (reader, writer, mut server) = pipe();
    let session = Session::new("fake", test_config());

    let script = async {
        let init = server.expect_request("initialize").await;
        server
            .send(Message::response(
                init.id,
                Err(ResponseError {
                    code: -32002,
                    message: "workspace not supported".to_string(),
                    data: None,
                }),
            ))
            .await;
    };
    let (started, ()) = tokio::join!(session.connect(reader, writer), script);

    let err = started.unwrap_err();
    assert_eq!(err.response_error().unwrap().code, -32002);
    assert_eq!(session.state(), SessionState::Failed);
    // The client closed its side.
    assert!(server.recv().await.is_none());

    let err = session.request("custom/after", None).await.unwrap_err();
    assert!(matches!(
        err,
        LspError::SessionState {
            state: SessionState::Failed,
            ..
        }
    ));
}

#[tokio::test]
async fn test_server_exit_fails_pending_requests() {
    let (session, mut server) = ready_session("fake", test_config()).await;
    let mut states = session.subscribe_state();

    let call = session.call("custom/slow", None).await.unwrap();
    server.expect_request("custom/slow").await;
    drop(server);

    let err = time::timeout(Duration::from_secs(5), call)
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_transport_closed());
    time::timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == SessionState::Failed),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(session.pending_requests(), 0);

    let err = session.request("custom/again", None).await.unwrap_err();
    assert!(matches!(err, LspError::SessionState { .. }));

    // Cleanup of a failed session keeps it failed.
    session.shutdown().await;
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_shutdown_rejects_pending_and_terminates_without_ack() {
    let (session, mut server) = ready_session("fake", test_config()).await;

    let mut calls = Vec::new();
    for method in ["custom/a", "custom/b", "custom/c"] {
        calls.push(session.call(method, None).await.unwrap());
        server.expect_request(method).await;
    }
    assert_eq!(session.pending_requests(), 3);

    let started = Instant::now();
    session.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(session.state(), SessionState::Terminated);

    for call in calls {
        assert!(call.await.unwrap_err().is_transport_closed());
    }
    assert_eq!(session.pending_requests(), 0);

    // The unanswered shutdown request is still followed by exit.
    server.expect_request("shutdown").await;
    server.expect_notification("exit").await;
    assert!(server.recv().await.is_none());
}

#[tokio::test]
async fn test_graceful_shutdown_sequence() {
    let (session, mut server) = ready_session("fake", test_config()).await;
    let mut states = session.subscribe_state();

    let script = async {
        let request = server.expect_request("shutdown").await;
        assert!(request.params.is_none());
        server.reply(request.id, Value::Null).await;
        server.expect_notification("exit").await;
        assert!(server.recv().await.is_none());
    };
    tokio::join!(session.shutdown(), script);

    assert_eq!(session.state(), SessionState::Terminated);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), SessionState::Terminated);

    // A second shutdown is a no-op.
    session.shutdown().await;
    assert_eq!(session.state(), SessionState::Terminated);

    let err = session
        .notify_open(&file_uri("a.txt"), "plaintext", "a")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LspError::SessionState {
            state: SessionState::Terminated,
            ..
        }
    ));
}
