//! Child process plumbing and the outbound writer task.

use std::env;
use std::process::Stdio;

use anyhow::{Context, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::codec::FrameWriter;
use crate::error::{LspError, Result};
use crate::protocol::Message;
use crate::types::ServerConfig;

const WRITER_CHANNEL_CAPACITY: usize = 64;

enum WriterCommand {
    Send(Message),
    Shutdown,
}

/// Cloneable handle onto the writer task.
///
/// Messages are written in the order they are handed over. Once the writer
/// has stopped every send fails with [`LspError::TransportClosed`].
#[derive(Clone, Debug)]
pub(crate) struct Outbound {
    tx: mpsc::Sender<WriterCommand>,
}

impl Outbound {
    pub async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(WriterCommand::Send(message))
            .await
            .map_err(|_| LspError::TransportClosed)
    }

    /// Queue without waiting for room; fails if the writer is backed up or gone.
    pub fn try_send(&self, message: Message) -> anyhow::Result<()> {
        match self.tx.try_send(WriterCommand::Send(message)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(anyhow!("writer queue full")),
            Err(TrySendError::Closed(_)) => Err(anyhow!("writer closed")),
        }
    }

    /// Ask the writer to close the stream once queued messages are flushed.
    pub fn close(&self) {
        if self.tx.try_send(WriterCommand::Shutdown).is_err() {
            tracing::debug!("Writer queue full or closed while requesting shutdown");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub(crate) fn spawn_writer<W>(writer: W, server: &str) -> (Outbound, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
    let server = server.to_string();
    let handle = tokio::spawn(async move {
        let mut writer = FrameWriter::new(writer);
        while let Some(cmd) = rx.recv().await {
            match cmd {
                WriterCommand::Send(message) => {
                    if let Err(e) = writer.write_message(&message).await {
                        tracing::warn!(server = %server, "LSP write error: {e:#}");
                        break;
                    }
                }
                WriterCommand::Shutdown => {
                    if let Err(e) = writer.close().await {
                        tracing::debug!(server = %server, "Closing server stdin: {e:#}");
                    }
                    break;
                }
            }
        }
    });
    (Outbound { tx }, handle)
}

/// Minimal glob matcher for env var denylist patterns.
/// Handles `*_SUFFIX`, `PREFIX_*`, `*_INFIX*`, and exact match.
/// Both pattern and key are compared in uppercase.
fn env_glob_matches(pattern: &str, key_upper: &str) -> bool {
    let pat = pattern.to_uppercase();
    match (pat.strip_prefix('*'), pat.strip_suffix('*')) {
        (Some(rest), Some(_)) => key_upper.contains(rest.strip_suffix('*').unwrap_or(rest)),
        (Some(suffix), None) => key_upper.ends_with(suffix),
        (None, Some(prefix)) => key_upper.starts_with(prefix),
        (None, None) => key_upper == pat,
    }
}

/// Spawn the configured server with piped stdio inside its workspace root.
pub(crate) fn spawn_process(config: &ServerConfig) -> Result<Child> {
    let startup_error = |source: anyhow::Error| LspError::ProcessStartup {
        command: config.command().to_string(),
        source,
    };

    let resolved = which::which(config.command())
        .with_context(|| format!("{} not found in PATH", config.command()))
        .map_err(startup_error)?;

    let mut cmd = Command::new(&resolved);
    cmd.args(config.args())
        .current_dir(config.workspace_root())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, _) in env::vars_os() {
        let Some(key) = key.to_str() else { continue };
        let upper = key.to_uppercase();
        if config
            .env_denylist()
            .iter()
            .any(|pat| env_glob_matches(pat, &upper))
        {
            cmd.env_remove(key);
        }
    }

    cmd.spawn()
        .with_context(|| format!("spawning {}", resolved.display()))
        .map_err(startup_error)
}

/// Forward the server's stderr to tracing, one line per event.
pub(crate) fn spawn_stderr_pump(stderr: ChildStderr, server: &str) -> JoinHandle<()> {
    let server = server.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => tracing::debug!(server = %server, "stderr: {line}"),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %server, "Reading server stderr: {e}");
                    break;
                }
            }
        }
    })
}
