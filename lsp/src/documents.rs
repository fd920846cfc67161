//! Document synchronizer: open documents and their version counters.
//!
//! Each operation validates against the tracked set and returns the
//! notification to hand to the transport together with a [`Commit`]. The
//! tracked state only moves when the caller applies the commit, after the
//! notification went out. Versions start at 1 on open and grow by exactly 1
//! per change; close retires the counter.

use std::collections::HashMap;

use crate::error::DocumentError;
use crate::protocol::{self, Message};

#[derive(Debug)]
struct Document {
    version: i32,
    text: String,
}

/// State change to apply once the matching notification has been sent.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub(crate) enum Commit {
    Track {
        uri: String,
        version: i32,
        text: String,
    },
    Untrack {
        uri: String,
    },
    Unchanged,
}

pub(crate) type Staged = (Message, Commit);

#[derive(Debug, Default)]
pub(crate) struct DocumentSync {
    docs: HashMap<String, Document>,
}

impl DocumentSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, uri: &str, language_id: &str, text: &str) -> Result<Staged, DocumentError> {
        if self.docs.contains_key(uri) {
            return Err(DocumentError::AlreadyOpen {
                uri: uri.to_string(),
            });
        }
        let version = 1;
        let event = Message::notification(
            "textDocument/didOpen",
            Some(protocol::did_open_params(uri, language_id, version, text)),
        );
        Ok((event, track(uri, version, text)))
    }

    /// Whole-document replacement.
    pub fn change(&self, uri: &str, text: &str) -> Result<Staged, DocumentError> {
        let version = self.tracked(uri)?.version + 1;
        let event = Message::notification(
            "textDocument/didChange",
            Some(protocol::did_change_params(uri, version, text)),
        );
        Ok((event, track(uri, version, text)))
    }

    pub fn save(&self, uri: &str) -> Result<Staged, DocumentError> {
        self.tracked(uri)?;
        let event = Message::notification(
            "textDocument/didSave",
            Some(protocol::did_save_params(uri)),
        );
        Ok((event, Commit::Unchanged))
    }

    pub fn close(&self, uri: &str) -> Result<Staged, DocumentError> {
        self.tracked(uri)?;
        let event = Message::notification(
            "textDocument/didClose",
            Some(protocol::did_close_params(uri)),
        );
        Ok((event, Commit::Untrack { uri: uri.to_string() }))
    }

    /// Open if untracked, change otherwise.
    pub fn sync(&self, uri: &str, language_id: &str, text: &str) -> Result<Staged, DocumentError> {
        self.change(uri, text)
            .or_else(|_| self.open(uri, language_id, text))
    }

    pub fn commit(&mut self, commit: Commit) {
        match commit {
            Commit::Track { uri, version, text } => {
                self.docs.insert(uri, Document { version, text });
            }
            Commit::Untrack { uri } => {
                self.docs.remove(&uri);
            }
            Commit::Unchanged => {}
        }
    }

    pub fn version(&self, uri: &str) -> Option<i32> {
        self.docs.get(uri).map(|d| d.version)
    }

    pub fn text(&self, uri: &str) -> Option<&str> {
        self.docs.get(uri).map(|d| d.text.as_str())
    }

    fn tracked(&self, uri: &str) -> Result<&Document, DocumentError> {
        self.docs.get(uri).ok_or_else(|| DocumentError::NotOpen {
            uri: uri.to_string(),
        })
    }
}

fn track(uri: &str, version: i32, text: &str) -> Commit {
    Commit::Track {
        uri: uri.to_string(),
        version,
        text: text.to_string(),
    }
}
