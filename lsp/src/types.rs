//! Public types consumed by the orchestrator.
//!
//! Callers construct [`LspConfig`] / [`ServerConfig`], read
//! [`DiagnosticsSnapshot`]s, and observe [`SessionState`] transitions.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

const DEFAULT_SETTLE_DELAY_MS: u64 = 10_000;

const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Environment variable patterns stripped from the server's environment.
///
/// Supports `*_SUFFIX`, `PREFIX_*`, `*_INFIX*` and exact names, compared
/// case-insensitively.
pub const DEFAULT_ENV_DENYLIST: &[&str] = &[
    "*_API_KEY",
    "*_SECRET",
    "*_SECRET_*",
    "*_TOKEN",
    "*_PASSWORD",
    "*_CREDENTIAL*",
    "AWS_*",
    "GITHUB_TOKEN",
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
];

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_settle_delay_ms() -> u64 {
    DEFAULT_SETTLE_DELAY_MS
}

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

fn default_env_denylist() -> Vec<String> {
    DEFAULT_ENV_DENYLIST.iter().map(|s| (*s).to_string()).collect()
}

/// Configuration for the orchestrator: named servers plus caller-facing limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LspConfig {
    /// Per-workspace server configurations, keyed by session name (e.g. "metals").
    #[serde(default)]
    servers: HashMap<String, ServerConfig>,
    /// Timeout applied by the orchestrator to queries and commands.
    #[serde(default = "default_request_timeout_ms")]
    request_timeout_ms: u64,
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            servers: HashMap::new(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl LspConfig {
    #[must_use]
    pub fn servers(&self) -> &HashMap<String, ServerConfig> {
        &self.servers
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn with_server(mut self, name: impl Into<String>, server: ServerConfig) -> Self {
        self.servers.insert(name.into(), server);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

/// Configuration for a single language server session.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Executable command (e.g. "metals", "rust-analyzer").
    command: String,
    #[serde(default)]
    args: Vec<String>,
    /// LSP language identifier sent with `didOpen` (e.g. "scala").
    language_id: String,
    /// File extensions routed to this server (e.g. `["scala", "sc"]`).
    #[serde(default)]
    file_extensions: Vec<String>,
    /// Workspace root sent as `rootUri`; also the child's working directory.
    workspace_root: PathBuf,
    /// Best-effort wait after `initialized` for servers that import
    /// projects asynchronously.
    #[serde(default = "default_settle_delay_ms")]
    settle_delay_ms: u64,
    /// Bound on the graceful shutdown handshake and process-exit wait.
    #[serde(default = "default_shutdown_timeout_ms")]
    shutdown_timeout_ms: u64,
    #[serde(default = "default_env_denylist")]
    env_denylist: Vec<String>,
}

impl ServerConfig {
    pub fn new(
        command: impl Into<String>,
        language_id: impl Into<String>,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            language_id: language_id.into(),
            file_extensions: Vec::new(),
            workspace_root: workspace_root.into(),
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            env_denylist: default_env_denylist(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_file_extensions(mut self, extensions: Vec<String>) -> Self {
        self.file_extensions = extensions;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    #[must_use]
    pub fn file_extensions(&self) -> &[String] {
        &self.file_extensions
    }

    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    #[must_use]
    pub fn env_denylist(&self) -> &[String] {
        &self.env_denylist
    }
}

/// Lifecycle state of a [`Session`](crate::Session).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Starting,
    Initializing,
    Ready,
    ShuttingDown,
    Terminated,
    Failed,
}

impl SessionState {
    /// `Terminated` and `Failed` admit no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting down",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    ///
    /// Returns `None` for values outside the LSP-defined range.
    /// Callers (boundary code) decide the fallback policy.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// A single diagnostic published by a language server.
///
/// Fields are private; external consumers read via accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticEntry {
    severity: DiagnosticSeverity,
    /// 0-indexed line number.
    line: u32,
    /// 0-indexed character offset.
    character: u32,
    message: String,
    source: Option<String>,
    /// Numeric codes are normalized to their decimal string.
    code: Option<String>,
}

impl DiagnosticEntry {
    #[must_use]
    pub fn new(severity: DiagnosticSeverity, line: u32, character: u32, message: String) -> Self {
        Self {
            severity,
            line,
            character,
            message,
            source: None,
            code: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    /// 0-indexed line number.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// 0-indexed character offset.
    #[must_use]
    pub fn character(&self) -> u32 {
        self.character
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Tool that produced the diagnostic (e.g. "bloop", "rustc").
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Format as `path:line:col: severity: [source] message` (1-indexed for display).
    #[must_use]
    pub fn display_with_path(&self, path: &Path) -> String {
        format!(
            "{}:{}:{}: {}: [{}] {}",
            path.display(),
            self.line + 1,
            self.character + 1,
            self.severity.label(),
            self.source.as_deref().unwrap_or("unknown"),
            self.message,
        )
    }
}

/// Owned copy of stored diagnostics, keyed by document URI.
///
/// Counts are computed from `documents`, never cached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    /// Per-document diagnostics, error-bearing documents first.
    documents: Vec<(String, Vec<DiagnosticEntry>)>,
}

impl DiagnosticsSnapshot {
    pub(crate) fn new(documents: Vec<(String, Vec<DiagnosticEntry>)>) -> Self {
        Self { documents }
    }

    #[must_use]
    pub fn documents(&self) -> &[(String, Vec<DiagnosticEntry>)] {
        &self.documents
    }

    /// Entries for one URI; empty if the URI is not in the snapshot.
    #[must_use]
    pub fn entries(&self, uri: &str) -> &[DiagnosticEntry] {
        self.documents
            .iter()
            .find(|(u, _)| u == uri)
            .map(|(_, items)| items.as_slice())
            .unwrap_or(&[])
    }

    /// Merge another snapshot's documents into this one (orchestrator aggregation).
    pub fn extend(&mut self, other: DiagnosticsSnapshot) {
        self.documents.extend(other.documents);
    }

    /// Whether the snapshot holds no diagnostics at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_count() == 0
    }

    fn count_by_severity(&self, severity: DiagnosticSeverity) -> usize {
        self.documents
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.severity() == severity)
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Warning)
    }

    #[must_use]
    pub fn info_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Information)
    }

    #[must_use]
    pub fn hint_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Hint)
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.documents.iter().map(|(_, items)| items.len()).sum()
    }

    /// Compact status string like "E:3 W:5".
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}
