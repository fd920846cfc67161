//! Orchestrates named sessions.
//!
//! Owns the session registry, routes file changes by extension and
//! workspace, applies the caller-facing request timeout, and aggregates
//! diagnostics across sessions. Dead sessions are removed from the map
//! (removal is the state transition).

use std::collections::HashMap;
use std::future::Future;
use std::mem;
use std::path::{self, Component, Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::time;

use crate::error::{LspError, Result};
use crate::protocol;
use crate::session::Session;
use crate::types::{DiagnosticEntry, DiagnosticsSnapshot, LspConfig, ServerConfig, SessionState};

/// Record `name` as the server for each of its extensions. First claim wins.
fn register_extensions(
    extension_map: &mut HashMap<String, String>,
    name: &str,
    config: &ServerConfig,
) {
    for ext in config.file_extensions() {
        if let Some(existing) = extension_map.get(ext) {
            tracing::warn!(
                "Multiple LSP servers configured for extension '{ext}': '{existing}' and '{name}'. Using '{existing}'."
            );
            continue;
        }
        extension_map.insert(ext.clone(), name.to_string());
    }
}

/// Build extension → session name map from config.
fn build_extension_map(config: &LspConfig) -> HashMap<String, String> {
    let mut extension_map = HashMap::new();
    let mut names: Vec<&String> = config.servers().keys().collect();
    names.sort();
    for name in names {
        register_extensions(&mut extension_map, name, &config.servers()[name]);
    }
    extension_map
}

fn normalize_path(path: &Path) -> PathBuf {
    let absolute = path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = Vec::new();
    for c in absolute.components() {
        match c {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out.iter().collect()
}

/// Merge per-session snapshots: one list per URI, errors first then by URI.
fn merge_snapshots(snapshots: Vec<DiagnosticsSnapshot>) -> DiagnosticsSnapshot {
    let mut merged: Vec<(String, Vec<DiagnosticEntry>)> = Vec::new();
    for snapshot in snapshots {
        for (uri, entries) in snapshot.documents() {
            match merged.iter_mut().find(|(u, _)| u == uri) {
                Some((_, existing)) => existing.extend(entries.iter().cloned()),
                None => merged.push((uri.clone(), entries.clone())),
            }
        }
    }
    merged.sort_by(|a, b| {
        let a_has_errors = a.1.iter().any(|d| d.severity().is_error());
        let b_has_errors = b.1.iter().any(|d| d.severity().is_error());
        b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
    });
    DiagnosticsSnapshot::new(merged)
}

/// Public facade over all configured language server sessions.
pub struct LspManager {
    config: LspConfig,
    sessions: HashMap<String, Arc<Session>>,
    /// Maps file extension (e.g. "scala") → session name (e.g. "metals").
    extension_map: HashMap<String, String>,
}

impl LspManager {
    /// Build a manager without starting anything.
    #[must_use]
    pub fn new(config: LspConfig) -> Self {
        let extension_map = build_extension_map(&config);
        Self {
            config,
            sessions: HashMap::new(),
            extension_map,
        }
    }

    /// Construct the manager and start every configured session.
    ///
    /// Sessions that fail to start are logged and skipped; a bad server
    /// config should not prevent the rest from working.
    pub async fn start(config: LspConfig) -> Self {
        let mut manager = Self::new(config);
        let mut names: Vec<String> = manager.config.servers().keys().cloned().collect();
        names.sort();
        for name in names {
            if let Err(e) = manager.start_session(&name).await {
                tracing::warn!(server = %name, "Failed to start LSP server: {e:#}");
            }
        }
        manager
    }

    /// Start the configured session `name`, or return it if already live.
    ///
    /// A previously failed or terminated session is replaced by a fresh one.
    /// Startup is bounded by the request timeout.
    pub async fn start_session(&mut self, name: &str) -> Result<Arc<Session>> {
        if let Some(existing) = self.sessions.get(name)
            && !existing.state().is_terminal()
        {
            return Ok(Arc::clone(existing));
        }
        let server_config = self
            .config
            .servers()
            .get(name)
            .cloned()
            .ok_or_else(|| LspError::UnknownSession {
                name: name.to_string(),
            })?;

        tracing::info!(server = %name, command = %server_config.command(), "Starting LSP server");
        let session = Arc::new(Session::new(name, server_config));
        let after = self.config.request_timeout();
        match time::timeout(after, session.start()).await {
            Ok(Ok(())) => {
                tracing::info!(server = %name, "LSP server started successfully");
                self.sessions.insert(name.to_string(), Arc::clone(&session));
                Ok(session)
            }
            Ok(Err(e)) => {
                self.sessions.remove(name);
                Err(e)
            }
            Err(_) => {
                session.shutdown().await;
                self.sessions.remove(name);
                Err(LspError::Timeout {
                    method: "initialize".to_string(),
                    after,
                })
            }
        }
    }

    /// Register a session started elsewhere (e.g. via [`Session::connect`]).
    ///
    /// Its file extensions join the routing table unless already claimed.
    pub fn insert_session(&mut self, session: Arc<Session>) -> Option<Arc<Session>> {
        let name = session.name().to_string();
        register_extensions(&mut self.extension_map, &name, session.config());
        self.sessions.insert(name, session)
    }

    pub fn session(&self, name: &str) -> Result<Arc<Session>> {
        self.sessions
            .get(name)
            .cloned()
            .ok_or_else(|| LspError::UnknownSession {
                name: name.to_string(),
            })
    }

    #[must_use]
    pub fn session_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Session responsible for `path`: matched by extension, and the path must
    /// lie inside that session's workspace root.
    #[must_use]
    pub fn session_for_path(&self, path: &Path) -> Option<Arc<Session>> {
        let ext = path.extension()?.to_str()?;
        let name = self.extension_map.get(ext)?;
        let session = self.sessions.get(name)?;
        let root = normalize_path(session.config().workspace_root());
        if !normalize_path(path).starts_with(&root) {
            tracing::debug!(
                server = %name,
                path = %path.display(),
                "File outside the session's workspace; not routing"
            );
            return None;
        }
        Some(Arc::clone(session))
    }

    /// Notify that a file was created or modified.
    ///
    /// Opens the document on first sight and sends a full-text change after
    /// that. Returns `false` when no session handles the file.
    pub async fn on_file_changed(&self, path: &Path, text: &str) -> Result<bool> {
        let Some(session) = self.session_for_path(path) else {
            return Ok(false);
        };
        let uri = protocol::path_to_file_uri(&normalize_path(path))?;
        session
            .sync_text(uri.as_str(), session.config().language_id(), text)
            .await?;
        Ok(true)
    }

    async fn with_timeout<T, F>(&self, method: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let after = self.config.request_timeout();
        time::timeout(after, fut)
            .await
            .map_err(|_| LspError::Timeout {
                method: method.to_string(),
                after,
            })?
    }

    /// Hover on session `name`, bounded by the request timeout.
    pub async fn hover(
        &self,
        name: &str,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Option<Value>> {
        let session = self.session(name)?;
        self.with_timeout(
            "textDocument/hover",
            session.query_at_position(uri, line, character),
        )
        .await
    }

    pub async fn execute(&self, name: &str, command: &str, args: Vec<Value>) -> Result<Value> {
        let session = self.session(name)?;
        self.with_timeout("workspace/executeCommand", session.execute(command, args))
            .await
    }

    pub async fn request(&self, name: &str, method: &str, params: Option<Value>) -> Result<Value> {
        let session = self.session(name)?;
        self.with_timeout(method, session.request(method, params))
            .await
    }

    /// Diagnostics across all sessions, or for one URI.
    #[must_use]
    pub fn diagnostics(&self, uri: Option<&str>) -> DiagnosticsSnapshot {
        let snapshots = self
            .session_names()
            .iter()
            .filter_map(|name| self.sessions.get(name))
            .map(|session| session.diagnostics(uri))
            .collect();
        let merged = merge_snapshots(snapshots);
        match uri {
            Some(uri) if merged.documents().is_empty() => {
                DiagnosticsSnapshot::new(vec![(uri.to_string(), Vec::new())])
            }
            _ => merged,
        }
    }

    /// Get only errors for specific files (for agent feedback).
    #[must_use]
    pub fn errors_for_files(&self, paths: &[PathBuf]) -> Vec<(PathBuf, Vec<DiagnosticEntry>)> {
        let mut by_uri: Vec<(String, PathBuf)> = Vec::new();
        for path in paths {
            match protocol::path_to_file_uri(&normalize_path(path)) {
                Ok(uri) => by_uri.push((uri.to_string(), path.clone())),
                Err(e) => tracing::debug!("Skipping diagnostics lookup: {e}"),
            }
        }
        let uris: Vec<String> = by_uri.iter().map(|(uri, _)| uri.clone()).collect();

        let mut result: Vec<(PathBuf, Vec<DiagnosticEntry>)> = Vec::new();
        for name in self.session_names() {
            let Some(session) = self.sessions.get(&name) else {
                continue;
            };
            for (uri, errors) in session.errors_for(&uris) {
                let Some((_, path)) = by_uri.iter().find(|(u, _)| *u == uri) else {
                    continue;
                };
                match result.iter_mut().find(|(p, _)| p == path) {
                    Some((_, existing)) => existing.extend(errors),
                    None => result.push((path.clone(), errors)),
                }
            }
        }
        result
    }

    /// Drop sessions that have failed or terminated; returns their names.
    pub fn remove_dead_sessions(&mut self) -> Vec<String> {
        let mut removed: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.state().is_terminal())
            .map(|(name, _)| name.clone())
            .collect();
        removed.sort();
        for name in &removed {
            if let Some(session) = self.sessions.remove(name) {
                match session.state() {
                    SessionState::Failed => tracing::warn!(server = %name, "LSP server failed"),
                    _ => tracing::info!(server = %name, "LSP server exited"),
                }
            }
        }
        removed
    }

    /// Whether at least one session is ready to serve requests.
    #[must_use]
    pub fn has_running_sessions(&self) -> bool {
        self.sessions
            .values()
            .any(|session| session.state() == SessionState::Ready)
    }

    /// Gracefully shut down all sessions.
    pub async fn shutdown_all(&mut self) {
        let sessions = mem::take(&mut self.sessions);
        let mut names: Vec<&String> = sessions.keys().collect();
        names.sort();
        for name in names {
            tracing::info!(server = %name, "Shutting down LSP server");
            sessions[name].shutdown().await;
        }
    }
}
