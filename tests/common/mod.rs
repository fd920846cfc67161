//! Shared test utilities and fixtures
//!
//! A scripted fake language server speaking framed JSON-RPC over an
//! in-memory duplex pipe, plus helpers to bring a session to `Ready`.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use bridge_lsp::codec::{self, FrameDecoder};
use bridge_lsp::protocol::{self, Message, Notification, Request, RequestId, Response};
use bridge_lsp::{ServerConfig, Session};
use serde_json::{Value, json};
use tokio::io::{self, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::time;

const PIPE_CAPACITY: usize = 256 * 1024;

/// Upper bound on any single wait in the fake server.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub type ClientReader = ReadHalf<DuplexStream>;
pub type ClientWriter = WriteHalf<DuplexStream>;

/// The server end of an in-memory transport.
pub struct FakeServer {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    decoder: FrameDecoder,
    inbox: VecDeque<Message>,
}

/// Connected client halves plus the fake server driving the other end.
pub fn pipe() -> (ClientReader, ClientWriter, FakeServer) {
    let (client, server) = io::duplex(PIPE_CAPACITY);
    let (client_reader, client_writer) = io::split(client);
    let (reader, writer) = io::split(server);
    let server = FakeServer {
        reader,
        writer,
        decoder: FrameDecoder::new(),
        inbox: VecDeque::new(),
    };
    (client_reader, client_writer, server)
}

impl FakeServer {
    /// Next message from the client, or `None` once the client closed its side.
    pub async fn recv(&mut self) -> Option<Message> {
        time::timeout(RECV_TIMEOUT, self.next_message())
            .await
            .expect("timed out waiting for a client message")
    }

    async fn next_message(&mut self) -> Option<Message> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return Some(message);
            }
            let n = self.reader.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            for frame in self.decoder.feed(&chunk[..n]) {
                self.inbox
                    .push_back(frame.expect("client sent a malformed frame"));
            }
        }
    }

    pub async fn expect_any_request(&mut self) -> Request {
        match self.recv().await {
            Some(Message::Request(request)) => request,
            other => panic!("expected a request, got {other:?}"),
        }
    }

    pub async fn expect_request(&mut self, method: &str) -> Request {
        let request = self.expect_any_request().await;
        assert_eq!(request.method, method, "unexpected request {request:?}");
        request
    }

    pub async fn expect_notification(&mut self, method: &str) -> Notification {
        match self.recv().await {
            Some(Message::Notification(n)) if n.method == method => n,
            other => panic!("expected {method} notification, got {other:?}"),
        }
    }

    pub async fn expect_response(&mut self) -> Response {
        match self.recv().await {
            Some(Message::Response(response)) => response,
            other => panic!("expected a response, got {other:?}"),
        }
    }

    pub async fn send(&mut self, message: Message) {
        let bytes = codec::encode(&message).expect("message encodes");
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("client side open");
        self.writer.flush().await.expect("client side open");
    }

    pub async fn reply(&mut self, id: RequestId, result: Value) {
        self.send(Message::response(id, Ok(result))).await;
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        self.send(Message::notification(method, Some(params))).await;
    }

    pub async fn publish_diagnostics(&mut self, uri: &str, diagnostics: Value) {
        self.notify(
            "textDocument/publishDiagnostics",
            json!({ "uri": uri, "diagnostics": diagnostics }),
        )
        .await;
    }

    /// Answer `initialize` and wait for `initialized`. Returns the request.
    pub async fn handshake(&mut self) -> Request {
        let init = self.expect_request("initialize").await;
        self.reply(
            init.id.clone(),
            json!({
                "capabilities": { "hoverProvider": true, "textDocumentSync": 1 },
                "serverInfo": { "name": "fake-ls", "version": "0.0.1" }
            }),
        )
        .await;
        self.expect_notification("initialized").await;
        init
    }
}

/// One diagnostic in wire form.
pub fn wire_diagnostic(line: u32, severity: u8, message: &str) -> Value {
    json!({
        "range": {
            "start": { "line": line, "character": 0 },
            "end": { "line": line, "character": 1 }
        },
        "severity": severity,
        "source": "fake-ls",
        "message": message
    })
}

#[cfg(windows)]
pub fn workspace_root() -> PathBuf {
    PathBuf::from(r"C:\work\project")
}

#[cfg(not(windows))]
pub fn workspace_root() -> PathBuf {
    PathBuf::from("/work/project")
}

pub fn file_uri(relative: &str) -> String {
    protocol::path_to_file_uri(&workspace_root().join(relative))
        .expect("absolute path")
        .to_string()
}

pub fn test_config() -> ServerConfig {
    ServerConfig::new("fake-ls", "plaintext", workspace_root())
        .with_file_extensions(vec!["txt".to_string()])
        .with_settle_delay(Duration::ZERO)
        .with_shutdown_timeout(Duration::from_millis(300))
}

/// Round-trip a request so everything the server sent before it has been dispatched.
pub async fn barrier(session: &Session, server: &mut FakeServer) {
    let script = async {
        let request = server.expect_request("test/barrier").await;
        server.reply(request.id, Value::Null).await;
    };
    let (result, ()) = tokio::join!(session.request("test/barrier", None), script);
    result.expect("barrier request");
}

/// A session named `name` connected to a fake server and past the handshake.
pub async fn ready_session(name: &str, config: ServerConfig) -> (Session, FakeServer) {
    let (reader, writer, mut server) = pipe();
    let session = Session::new(name, config);
    let (started, _) = tokio::join!(session.connect(reader, writer), server.handshake());
    started.expect("session should reach Ready");
    (session, server)
}
