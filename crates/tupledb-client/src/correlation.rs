//! Request/response correlation table.
//!
//! Each in-flight request on a connection owns one slot keyed by its
//! correlation id. A slot is a `oneshot` sender, so it can be fulfilled at
//! most once; the entry leaves the table when it is fulfilled, abandoned by
//! the caller, or failed because the connection went away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;
use tupledb_common::protocol::error::{ClientError, Result};
use tupledb_common::protocol::{RequestId, Response};

/// Receiving side of a correlation slot.
pub type ResponseSlot = oneshot::Receiver<Result<Response>>;

pub struct CorrelationTable {
    next_id: AtomicU64,
    inner: Mutex<TableInner>,
}

struct TableInner {
    pending: HashMap<RequestId, oneshot::Sender<Result<Response>>>,
    /// Set once the connection is torn down; no new slots after that.
    closed: Option<ClientError>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(TableInner {
                pending: HashMap::new(),
                closed: None,
            }),
        }
    }

    /// Allocates the next id and registers a slot for it.
    ///
    /// Fails with the close reason if the table has been failed already.
    pub fn register(&self) -> Result<(RequestId, ResponseSlot)> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        if let Some(reason) = &inner.closed {
            return Err(reason.clone());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        inner.pending.insert(id, tx);
        Ok((id, rx))
    }

    /// Fulfils the slot for `id`. Returns `false` when no slot exists, which
    /// happens for late responses whose caller already gave up.
    pub fn complete(&self, id: RequestId, result: Result<Response>) -> bool {
        let sender = self.lock().pending.remove(&id);
        match sender {
            // The receiver may have been dropped in the meantime; that is the
            // same situation as a missing slot.
            Some(sender) => sender.send(result).is_ok(),
            None => false,
        }
    }

    /// Drops the slot for `id` without fulfilling it.
    pub fn remove(&self, id: RequestId) -> bool {
        self.lock().pending.remove(&id).is_some()
    }

    /// Fails every pending slot with `reason` and refuses new registrations.
    /// Returns how many slots were failed.
    pub fn fail_all(&self, reason: ClientError) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason.clone());
            }
            inner.pending.drain().collect()
        };

        let count = drained.len();
        for (_, sender) in drained {
            let _ = sender.send(Err(reason.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableInner> {
        // A poisoned table only means a panic elsewhere while holding the
        // lock; the map itself is still consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes its slot from the table when dropped.
///
/// Held by a waiting caller; if the wait is abandoned (timeout, cancellation)
/// the entry does not linger and a late response is discarded.
pub struct SlotGuard<'a> {
    table: &'a CorrelationTable,
    id: RequestId,
}

impl<'a> SlotGuard<'a> {
    pub fn new(table: &'a CorrelationTable, id: RequestId) -> Self {
        Self { table, id }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}
