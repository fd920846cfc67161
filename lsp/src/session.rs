//! One language server session: its transport and its lifecycle.
//!
//! ```text
//! NotStarted → Starting → Initializing → Ready → ShuttingDown → Terminated
//!                  └───────────┴───────────┴──→ Failed
//! ```
//!
//! A session owns exactly one reader task (decode + dispatch, in arrival
//! order) and one writer task (whole frames, in hand-off order).

use std::fmt;
use std::io;
use std::path::{self, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{Mutex as AsyncMutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::codec::FrameDecoder;
use crate::correlator::{Correlator, PendingCall};
use crate::diagnostics::DiagnosticsStore;
use crate::documents::{DocumentSync, Staged};
use crate::error::{LspError, Result};
use crate::protocol::{self, Message, Notification};
use crate::router::NotificationRouter;
use crate::transport::{self, Outbound};
use crate::types::{DiagnosticEntry, DiagnosticsSnapshot, ServerConfig, SessionState};

const READ_CHUNK_BYTES: usize = 16 * 1024;

const LIVE_STATES: &[SessionState] = &[
    SessionState::Starting,
    SessionState::Initializing,
    SessionState::Ready,
];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum ReaderExit {
    Cancelled,
    Eof,
    Failed(io::Error),
}

/// State shared between the session handle and its reader task.
struct Shared {
    name: String,
    state: watch::Sender<SessionState>,
    correlator: Correlator,
    router: NotificationRouter,
    diagnostics: Arc<Mutex<DiagnosticsStore>>,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move to `to` if the current state is one of `from`.
    fn transition(&self, from: &[SessionState], to: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if !from.contains(current) {
                return false;
            }
            tracing::info!(server = %self.name, from = %current, to = %to, "Session state changed");
            *current = to;
            true
        })
    }

    fn dispatch(&self, message: Message, outbound: &Outbound) {
        match message {
            Message::Response(response) => self.correlator.complete(response),
            Message::Notification(notification) => self.router.dispatch(&notification),
            Message::Request(request) => {
                // Servers may send client/registerCapability, workspace/configuration,
                // etc. and block until they get an answer.
                tracing::debug!(
                    server = %self.name,
                    method = %request.method,
                    "Server request not supported; replying method not found"
                );
                // Never wait on the writer here; responses would stall behind it.
                let reply = Message::method_not_found(request.id, &request.method);
                if let Err(e) = outbound.try_send(reply) {
                    tracing::warn!(server = %self.name, "Could not answer server request: {e}");
                }
            }
        }
    }

    fn reader_finished(&self, exit: ReaderExit) {
        match exit {
            ReaderExit::Cancelled => {
                tracing::debug!(server = %self.name, "Reader stopped");
                return;
            }
            ReaderExit::Eof => {
                if self.transition(LIVE_STATES, SessionState::Failed) {
                    tracing::warn!(server = %self.name, "Language server closed its output");
                } else {
                    tracing::debug!(server = %self.name, "Language server closed stdout");
                }
            }
            ReaderExit::Failed(e) => {
                if self.transition(LIVE_STATES, SessionState::Failed) {
                    tracing::warn!(server = %self.name, "LSP reader error: {e}");
                } else {
                    tracing::debug!(server = %self.name, "LSP reader error after shutdown: {e}");
                }
            }
        }
        self.correlator.close();
    }
}

async fn read_loop<R>(
    mut reader: R,
    shared: Arc<Shared>,
    outbound: Outbound,
    cancel: CancellationToken,
    live: oneshot::Sender<()>,
) where
    R: AsyncRead + Unpin,
{
    let _ = live.send(());
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];

    let exit = loop {
        let read = tokio::select! {
            () = cancel.cancelled() => break ReaderExit::Cancelled,
            read = reader.read(&mut chunk) => read,
        };
        let n = match read {
            Ok(0) => break ReaderExit::Eof,
            Ok(n) => n,
            Err(e) => break ReaderExit::Failed(e),
        };
        for frame in decoder.feed(&chunk[..n]) {
            match frame {
                Ok(message) => shared.dispatch(message, &outbound),
                Err(e) => tracing::warn!(server = %shared.name, "Dropping malformed frame: {e}"),
            }
        }
    };

    shared.reader_finished(exit);
}

/// Tasks and process owned by a started session.
struct SessionIo {
    child: Option<Child>,
    outbound: Outbound,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    stderr: Option<JoinHandle<()>>,
}

impl SessionIo {
    /// Close stdin, reap the process (killing it after `grace`), stop the tasks.
    async fn finish(mut self, server: &str, grace: Duration) {
        self.outbound.close();
        if time::timeout(grace, &mut self.writer).await.is_err() {
            self.writer.abort();
        }

        if let Some(mut child) = self.child.take() {
            match time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => tracing::info!(server, %status, "Language server exited"),
                Ok(Err(e)) => tracing::warn!(server, "Waiting for language server: {e}"),
                Err(_) => {
                    tracing::debug!(server, "Language server didn't exit in time, killing");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(server, "Killing language server: {e}");
                    }
                }
            }
        }

        self.cancel.cancel();
        if time::timeout(grace, &mut self.reader).await.is_err() {
            self.reader.abort();
        }
        if let Some(stderr) = self.stderr.take() {
            stderr.abort();
        }
    }
}

/// A single language server session.
///
/// All operations take `&self`; share a session across tasks with `Arc`.
pub struct Session {
    name: String,
    config: ServerConfig,
    shared: Arc<Shared>,
    documents: AsyncMutex<DocumentSync>,
    io: AsyncMutex<Option<SessionIo>>,
    outbound: OnceLock<Outbound>,
    ready_at: OnceLock<Instant>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Session {
    #[must_use]
    pub fn new(name: impl Into<String>, config: ServerConfig) -> Self {
        let name = name.into();
        let diagnostics = Arc::new(Mutex::new(DiagnosticsStore::new()));
        let (state, _) = watch::channel(SessionState::NotStarted);
        let shared = Arc::new(Shared {
            name: name.clone(),
            state,
            correlator: Correlator::new(),
            router: NotificationRouter::new(name.clone(), Arc::clone(&diagnostics)),
            diagnostics,
        });
        Self {
            name,
            config,
            shared,
            documents: AsyncMutex::new(DocumentSync::new()),
            io: AsyncMutex::new(None),
            outbound: OnceLock::new(),
            ready_at: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Receiver that observes every state transition.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Spawn the configured server and run the initialize handshake.
    ///
    /// Returns once the session is `Ready`. See [`Session::settled`] for the
    /// post-initialize settle delay.
    pub async fn start(&self) -> Result<()> {
        self.begin("start")?;

        let mut child = match transport::spawn_process(&self.config) {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(server = %self.name, "Failed to start language server: {e}");
                self.shared
                    .transition(&[SessionState::Starting], SessionState::Failed);
                return Err(e);
            }
        };

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            if let Err(e) = child.kill().await {
                tracing::debug!(server = %self.name, "Killing language server: {e}");
            }
            self.shared
                .transition(&[SessionState::Starting], SessionState::Failed);
            return Err(LspError::ProcessStartup {
                command: self.config.command().to_string(),
                source: anyhow!("child stdio was not piped"),
            });
        };
        let stderr = child
            .stderr
            .take()
            .map(|stderr| transport::spawn_stderr_pump(stderr, &self.name));

        tracing::info!(
            server = %self.name,
            command = %self.config.command(),
            pid = ?child.id(),
            "Language server spawned"
        );
        self.run(stdout, stdin, Some(child), stderr).await
    }

    /// Run the session over an already-established stream instead of a
    /// spawned process (a socket, a pipe pair, an in-memory transport).
    pub async fn connect<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.begin("connect")?;
        self.run(reader, writer, None, None).await
    }

    fn begin(&self, operation: &'static str) -> Result<()> {
        if self
            .shared
            .transition(&[SessionState::NotStarted], SessionState::Starting)
        {
            Ok(())
        } else {
            Err(LspError::SessionState {
                operation,
                state: self.state(),
            })
        }
    }

    async fn run<R, W>(
        &self,
        reader: R,
        writer: W,
        child: Option<Child>,
        stderr: Option<JoinHandle<()>>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, writer) = transport::spawn_writer(writer, &self.name);
        let cancel = CancellationToken::new();
        let (live_tx, live_rx) = oneshot::channel();
        let reader = tokio::spawn(read_loop(
            reader,
            Arc::clone(&self.shared),
            outbound.clone(),
            cancel.clone(),
            live_tx,
        ));

        *self.io.lock().await = Some(SessionIo {
            child,
            outbound: outbound.clone(),
            cancel,
            reader,
            writer,
            stderr,
        });
        let _ = self.outbound.set(outbound.clone());

        let handshake = async {
            live_rx.await.map_err(|_| LspError::TransportClosed)?;
            if !self
                .shared
                .transition(&[SessionState::Starting], SessionState::Initializing)
            {
                return Err(LspError::TransportClosed);
            }
            self.initialize(&outbound).await
        };

        match handshake.await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(server = %self.name, "LSP initialize failed: {e}");
                self.teardown(SessionState::Failed).await;
                Err(e)
            }
        }
    }

    async fn initialize(&self, outbound: &Outbound) -> Result<()> {
        let root = absolute_root(self.config.workspace_root());
        let root_uri = protocol::path_to_file_uri(&root)?;
        let workspace_name = root
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("workspace");

        let params = protocol::initialize_params(root_uri.as_str(), workspace_name);
        let result = self
            .shared
            .correlator
            .send(outbound, "initialize", Some(params))
            .await?
            .await?;

        if let Some(info) = result.get("serverInfo") {
            tracing::info!(
                server = %self.name,
                name = info["name"].as_str().unwrap_or("unknown"),
                version = info["version"].as_str().unwrap_or("unknown"),
                "Language server initialized"
            );
        }

        outbound
            .send(Message::notification("initialized", Some(json!({}))))
            .await?;

        let _ = self.ready_at.set(Instant::now());
        if !self
            .shared
            .transition(&[SessionState::Initializing], SessionState::Ready)
        {
            return Err(LspError::TransportClosed);
        }
        Ok(())
    }

    /// Wait until the settle delay after `Ready` has elapsed.
    ///
    /// Waits out a start in progress. Returns immediately if the session was
    /// never started or never became ready.
    pub async fn settled(&self) {
        let mut states = self.subscribe_state();
        let _ = states
            .wait_for(|state| {
                !matches!(state, SessionState::Starting | SessionState::Initializing)
            })
            .await;
        if let Some(ready_at) = self.ready_at.get() {
            time::sleep_until(*ready_at + self.config.settle_delay()).await;
        }
    }

    /// Gracefully stop the server. Safe to call in any state, any number of times.
    pub async fn shutdown(&self) {
        let previous = self.state();
        match previous {
            SessionState::Terminated => return,
            SessionState::NotStarted => {
                self.shared
                    .transition(&[SessionState::NotStarted], SessionState::Terminated);
                return;
            }
            SessionState::Failed => {
                self.teardown(SessionState::Failed).await;
                return;
            }
            _ => {}
        }

        self.shared
            .transition(LIVE_STATES, SessionState::ShuttingDown);
        if previous == SessionState::Ready
            && let Some(outbound) = self.outbound.get()
        {
            self.exit_handshake(outbound).await;
        }
        self.teardown(SessionState::Terminated).await;
    }

    async fn exit_handshake(&self, outbound: &Outbound) {
        let grace = self.config.shutdown_timeout();
        let request = async {
            self.shared
                .correlator
                .send(outbound, "shutdown", None)
                .await?
                .await
        };
        match time::timeout(grace, request).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::debug!(server = %self.name, "shutdown request failed: {e}"),
            Err(_) => tracing::debug!(server = %self.name, "No shutdown reply within {grace:?}"),
        }
        if let Err(e) = outbound.send(Message::notification("exit", None)).await {
            tracing::debug!(server = %self.name, "Could not send exit: {e}");
        }
    }

    async fn teardown(&self, final_state: SessionState) {
        let io = self.io.lock().await.take();
        self.shared.correlator.close();
        if let Some(io) = io {
            io.finish(&self.name, self.config.shutdown_timeout()).await;
        }
        let from: &[SessionState] = match final_state {
            SessionState::Terminated => &[SessionState::ShuttingDown],
            _ => LIVE_STATES,
        };
        self.shared.transition(from, final_state);
    }

    fn ready_outbound(&self, operation: &'static str) -> Result<Outbound> {
        let state = self.state();
        if state != SessionState::Ready {
            return Err(LspError::SessionState { operation, state });
        }
        self.outbound
            .get()
            .filter(|outbound| !outbound.is_closed())
            .cloned()
            .ok_or(LspError::TransportClosed)
    }

    pub async fn notify_open(&self, uri: &str, language_id: &str, text: &str) -> Result<()> {
        let outbound = self.ready_outbound("open a document")?;
        let mut documents = self.documents.lock().await;
        let staged = documents.open(uri, language_id, text)?;
        send_staged(&outbound, &mut documents, staged).await
    }

    pub async fn notify_change(&self, uri: &str, text: &str) -> Result<()> {
        let outbound = self.ready_outbound("change a document")?;
        let mut documents = self.documents.lock().await;
        let staged = documents.change(uri, text)?;
        send_staged(&outbound, &mut documents, staged).await
    }

    pub async fn notify_save(&self, uri: &str) -> Result<()> {
        let outbound = self.ready_outbound("save a document")?;
        let mut documents = self.documents.lock().await;
        let staged = documents.save(uri)?;
        send_staged(&outbound, &mut documents, staged).await
    }

    pub async fn notify_close(&self, uri: &str) -> Result<()> {
        let outbound = self.ready_outbound("close a document")?;
        let mut documents = self.documents.lock().await;
        let staged = documents.close(uri)?;
        send_staged(&outbound, &mut documents, staged).await
    }

    /// Open `uri` if untracked, otherwise replace its text.
    pub async fn sync_text(&self, uri: &str, language_id: &str, text: &str) -> Result<()> {
        let outbound = self.ready_outbound("sync a document")?;
        let mut documents = self.documents.lock().await;
        let staged = documents.sync(uri, language_id, text)?;
        send_staged(&outbound, &mut documents, staged).await
    }

    /// Current version of an open document.
    pub async fn document_version(&self, uri: &str) -> Option<i32> {
        self.documents.lock().await.version(uri)
    }

    /// Last text sent for an open document.
    pub async fn document_text(&self, uri: &str) -> Option<String> {
        self.documents.lock().await.text(uri).map(str::to_string)
    }

    /// Issue a request and return its pending handle without waiting.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<PendingCall> {
        let outbound = self.ready_outbound("send a request")?;
        self.shared.correlator.send(&outbound, method, params).await
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.call(method, params).await?.await
    }

    /// `textDocument/hover` at a zero-based position. A null result is `None`.
    pub async fn query_at_position(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Option<Value>> {
        let params = protocol::text_document_position_params(uri, line, character);
        let result = self.request("textDocument/hover", Some(params)).await?;
        Ok((!result.is_null()).then_some(result))
    }

    /// `workspace/executeCommand`.
    pub async fn execute(&self, command: &str, args: Vec<Value>) -> Result<Value> {
        let params = protocol::execute_command_params(command, args);
        self.request("workspace/executeCommand", Some(params)).await
    }

    #[must_use]
    pub fn diagnostics(&self, uri: Option<&str>) -> DiagnosticsSnapshot {
        lock(&self.shared.diagnostics).snapshot(uri)
    }

    /// Error-severity entries for the given URIs, skipping clean documents.
    #[must_use]
    pub fn errors_for(&self, uris: &[String]) -> Vec<(String, Vec<DiagnosticEntry>)> {
        lock(&self.shared.diagnostics).errors_for(uris)
    }

    /// Subscribe a handler to a notification method. Valid in any state.
    pub fn on_notification<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.router.on(method, handler);
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.pending_count()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(io) = self.io.get_mut().as_ref() {
            io.cancel.cancel();
        }
        self.shared.correlator.close();
    }
}

fn absolute_root(root: &Path) -> PathBuf {
    path::absolute(root).unwrap_or_else(|_| root.to_path_buf())
}

/// Send a staged document notification, then apply its state change.
async fn send_staged(
    outbound: &Outbound,
    documents: &mut DocumentSync,
    (event, commit): Staged,
) -> Result<()> {
    outbound.send(event).await?;
    documents.commit(commit);
    Ok(())
}
