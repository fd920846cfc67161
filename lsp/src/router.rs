//! Notification routing.
//!
//! Diagnostics and server log messages are handled built-in; any number of
//! handlers may additionally subscribe to a method name. A failing or
//! panicking handler is logged and never stops dispatch.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;
use serde_json::Value;

use crate::diagnostics::DiagnosticsStore;
use crate::protocol::{
    LOG_MESSAGE, LogMessageParams, LspDiagnostic, Notification, PUBLISH_DIAGNOSTICS, PublishDiagnosticsParams,
    SHOW_MESSAGE,
};

type Handler = Arc<dyn Fn(&Notification) -> anyhow::Result<()> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct NotificationRouter {
    server: String,
    diagnostics: Arc<Mutex<DiagnosticsStore>>,
    handlers: Mutex<HashMap<String, Vec<Handler>>>,
}

impl NotificationRouter {
    pub fn new(server: impl Into<String>, diagnostics: Arc<Mutex<DiagnosticsStore>>) -> Self {
        Self {
            server: server.into(),
            diagnostics,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn on<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        lock(&self.handlers)
            .entry(method.into())
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn dispatch(&self, notification: &Notification) {
        let method = notification.method.as_str();
        match method {
            PUBLISH_DIAGNOSTICS => self.publish_diagnostics(notification.params.as_ref()),
            LOG_MESSAGE | SHOW_MESSAGE => self.log_server_message(notification.params.as_ref()),
            _ => {}
        }

        // Snapshot so handlers can subscribe further handlers without deadlocking.
        let handlers = lock(&self.handlers).get(method).cloned().unwrap_or_default();
        if handlers.is_empty() && !is_builtin(method) {
            tracing::trace!(server = %self.server, method, "Ignoring notification");
            return;
        }

        for (index, handler) in handlers.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(notification))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    server = %self.server,
                    method,
                    handler = index,
                    "Notification handler failed: {e:#}"
                ),
                Err(_) => tracing::warn!(
                    server = %self.server,
                    method,
                    handler = index,
                    "Notification handler panicked"
                ),
            }
        }
    }

    fn publish_diagnostics(&self, params: Option<&Value>) {
        let Some(params) = params else {
            tracing::warn!(server = %self.server, "publishDiagnostics without params");
            return;
        };
        match PublishDiagnosticsParams::deserialize(params) {
            Ok(parsed) => {
                let entries = parsed
                    .diagnostics
                    .iter()
                    .map(LspDiagnostic::to_entry)
                    .collect();
                tracing::debug!(
                    server = %self.server,
                    uri = %parsed.uri,
                    count = parsed.diagnostics.len(),
                    "Diagnostics published"
                );
                lock(&self.diagnostics).publish(parsed.uri, entries);
            }
            Err(e) => {
                tracing::warn!(
                    server = %self.server,
                    "Failed to parse publishDiagnostics: {e}"
                );
            }
        }
    }

    fn log_server_message(&self, params: Option<&Value>) {
        let Some(parsed) = params.and_then(|p| LogMessageParams::deserialize(p).ok()) else {
            tracing::debug!(server = %self.server, "Malformed log message from server");
            return;
        };
        let message = parsed.message;
        match parsed.kind {
            1 => tracing::error!(server = %self.server, "{message}"),
            2 => tracing::warn!(server = %self.server, "{message}"),
            3 => tracing::info!(server = %self.server, "{message}"),
            _ => tracing::debug!(server = %self.server, "{message}"),
        }
    }
}

fn is_builtin(method: &str) -> bool {
    matches!(method, PUBLISH_DIAGNOSTICS | LOG_MESSAGE | SHOW_MESSAGE)
}
