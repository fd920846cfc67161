//! Request/response correlation.
//!
//! Every outbound request gets a fresh positive id and a one-shot completion
//! slot. Responses resolve exactly one slot; closing the correlator rejects
//! whatever is still outstanding.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{LspError, Result};
use crate::protocol::{Message, Response};
use crate::transport::Outbound;

type Completion = oneshot::Sender<Result<Value>>;

#[derive(Debug, Default)]
struct PendingTable {
    calls: HashMap<u64, Completion>,
    closed: bool,
}

type SharedTable = Arc<Mutex<PendingTable>>;

fn lock(table: &Mutex<PendingTable>) -> MutexGuard<'_, PendingTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub(crate) struct Correlator {
    next_id: AtomicU64,
    pending: SharedTable,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(PendingTable::default())),
        }
    }

    /// Allocate an id and its completion slot without sending anything.
    pub fn register(&self) -> Result<PendingCall> {
        let mut table = lock(&self.pending);
        if table.closed {
            return Err(LspError::TransportClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        table.calls.insert(id, tx);
        Ok(PendingCall {
            id,
            rx,
            table: Arc::clone(&self.pending),
            settled: false,
        })
    }

    /// Register a request and hand it to the writer.
    ///
    /// The request is queued in order before this returns. If the writer has
    /// already stopped the slot is released again and the call fails.
    pub async fn send(
        &self,
        outbound: &Outbound,
        method: &str,
        params: Option<Value>,
    ) -> Result<PendingCall> {
        let call = self.register()?;
        outbound
            .send(Message::request(call.id(), method, params))
            .await?;
        Ok(call)
    }

    /// Resolve the slot matching `response.id`. Unknown ids are dropped.
    pub fn complete(&self, response: Response) {
        let Some(id) = response.id.as_sequence() else {
            tracing::warn!(id = %response.id, "Discarding response with a non-client id");
            return;
        };
        let slot = lock(&self.pending).calls.remove(&id);
        let Some(tx) = slot else {
            tracing::warn!(id, "Discarding response for unknown or abandoned request");
            return;
        };
        // The caller may have stopped waiting; nothing to do then.
        let _ = tx.send(response.outcome.map_err(LspError::Protocol));
    }

    /// Reject every outstanding call with `TransportClosed` and refuse new ones.
    pub fn close(&self) -> usize {
        let drained: Vec<Completion> = {
            let mut table = lock(&self.pending);
            table.closed = true;
            table.calls.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(LspError::TransportClosed));
        }
        if count > 0 {
            tracing::debug!(count, "Rejected outstanding requests");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).calls.len()
    }
}

/// A request awaiting its response.
///
/// Resolves to the server's `result`, a [`LspError::Protocol`] carrying the
/// error payload, or [`LspError::TransportClosed`]. Dropping it before it
/// resolves releases the id; a late response is then discarded.
#[derive(Debug)]
#[must_use = "a pending call does nothing unless awaited"]
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<Result<Value>>,
    table: SharedTable,
    settled: bool,
}

impl PendingCall {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(outcome)) => outcome,
            Poll::Ready(Err(_)) => Err(LspError::TransportClosed),
        };
        self.settled = true;
        Poll::Ready(outcome)
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.settled {
            lock(&self.table).calls.remove(&self.id);
        }
    }
}
