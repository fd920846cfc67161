//! Latest diagnostic set per document URI.

use std::collections::HashMap;

use crate::types::{DiagnosticEntry, DiagnosticsSnapshot};

#[derive(Debug, Default)]
pub(crate) struct DiagnosticsStore {
    data: HashMap<String, Vec<DiagnosticEntry>>,
}

impl DiagnosticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace (never merge) the entries for `uri`. An empty list clears it.
    pub fn publish(&mut self, uri: String, entries: Vec<DiagnosticEntry>) {
        if entries.is_empty() {
            self.data.remove(&uri);
        } else {
            self.data.insert(uri, entries);
        }
    }

    /// Owned copy of one URI's entries, or of everything.
    ///
    /// A single-URI snapshot always contains that URI, with an empty list
    /// when nothing is stored for it.
    pub fn snapshot(&self, uri: Option<&str>) -> DiagnosticsSnapshot {
        if let Some(uri) = uri {
            let items = self.data.get(uri).cloned().unwrap_or_default();
            return DiagnosticsSnapshot::new(vec![(uri.to_string(), items)]);
        }

        let mut documents: Vec<(String, Vec<DiagnosticEntry>)> = self
            .data
            .iter()
            .map(|(uri, items)| (uri.clone(), items.clone()))
            .collect();

        // Sort: documents with errors first, then alphabetically
        documents.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(|d| d.severity().is_error());
            let b_has_errors = b.1.iter().any(|d| d.severity().is_error());
            b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
        });

        DiagnosticsSnapshot::new(documents)
    }

    pub fn errors_for(&self, uris: &[String]) -> Vec<(String, Vec<DiagnosticEntry>)> {
        let mut result = Vec::new();
        for uri in uris {
            if let Some(items) = self.data.get(uri) {
                let errors: Vec<DiagnosticEntry> = items
                    .iter()
                    .filter(|d| d.severity().is_error())
                    .cloned()
                    .collect();
                if !errors.is_empty() {
                    result.push((uri.clone(), errors));
                }
            }
        }
        result
    }
}
