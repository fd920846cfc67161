//! Transport and session layer for driving language servers over JSON-RPC.
//!
//! A [`Session`] owns one server process: it frames messages, correlates
//! requests with responses, routes notifications, keeps the latest
//! diagnostics per document and tracks open-document versions. An
//! [`LspManager`] holds named sessions and routes work between them.

pub mod codec;
pub mod error;
pub mod protocol;
pub mod types;

mod correlator;
mod diagnostics;
mod documents;
mod manager;
mod router;
mod session;
mod transport;

pub use correlator::PendingCall;
pub use error::{DocumentError, LspError, Result};
pub use manager::LspManager;
pub use session::Session;
pub use types::{
    DiagnosticEntry, DiagnosticSeverity, DiagnosticsSnapshot, LspConfig, ServerConfig,
    SessionState,
};
