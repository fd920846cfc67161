//! Error taxonomy for the transport and session layer.

use std::path::PathBuf;
use std::result::Result as StdResult;
use std::time::Duration;

use crate::protocol::ResponseError;
use crate::types::SessionState;

pub type Result<T, E = LspError> = StdResult<T, E>;

/// Misuse of the document synchronizer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("document already open: {uri}")]
    AlreadyOpen { uri: String },
    #[error("document not open: {uri}")]
    NotOpen { uri: String },
}

#[derive(Debug, thiserror::Error)]
pub enum LspError {
    /// The server answered with a JSON-RPC error payload.
    #[error("server error: {0}")]
    Protocol(ResponseError),
    /// The server process exited or the reader loop ended.
    #[error("transport closed")]
    TransportClosed,
    #[error("cannot {operation} while session is {state}")]
    SessionState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("failed to start language server `{command}`: {source}")]
    ProcessStartup {
        command: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("{method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },
    #[error("unknown session: {name}")]
    UnknownSession { name: String },
    #[error("cannot convert path to file URI: {}", path.display())]
    InvalidUri { path: PathBuf },
}

impl LspError {
    #[must_use]
    pub fn is_transport_closed(&self) -> bool {
        matches!(self, Self::TransportClosed)
    }

    /// Server-reported error payload, if this is a protocol error.
    #[must_use]
    pub fn response_error(&self) -> Option<&ResponseError> {
        match self {
            Self::Protocol(err) => Some(err),
            _ => None,
        }
    }
}
