//! The call buffer: operation name → calls issued before readiness.
//!
//! # Guarantees
//!
//! - **FIFO per operation**: each list keeps arrival order
//! - **Operation order is first-seen order**: `to_vec` concatenates lists in
//!   the order their operation was first pushed, which is not a total
//!   temporal order across operations
//! - **No single-record removal**: flushing reads a snapshot and iterates it;
//!   the `called` guard on each record makes re-invocation a no-op
//! - **In-memory only**: records are lost if the process exits before flush

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;

use crate::operation::Operation;
use crate::record::CallRecord;

type Entries = IndexMap<Operation, Vec<Arc<CallRecord>>>;

/// Calls issued before the engine became ready, grouped by operation.
///
/// One buffer exists per façade. It is shared with the loader so the loader
/// can seed it (e.g. with snippet records) or flush it by hand.
#[derive(Default)]
pub struct CallBuffer {
    entries: Mutex<Entries>,
}

impl CallBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record to the list for its operation.
    pub fn push(&self, record: CallRecord) -> Arc<CallRecord> {
        let record = Arc::new(record);
        self.lock()
            .entry(record.operation())
            .or_default()
            .push(Arc::clone(&record));
        record
    }

    /// Append many records, in order.
    pub fn extend<I>(&self, records: I)
    where
        I: IntoIterator<Item = CallRecord>,
    {
        let mut entries = self.lock();
        for record in records {
            entries
                .entry(record.operation())
                .or_default()
                .push(Arc::new(record));
        }
    }

    /// Snapshot of the calls buffered for one operation, in arrival order.
    pub fn get_calls(&self, operation: Operation) -> Vec<Arc<CallRecord>> {
        self.lock().get(&operation).cloned().unwrap_or_default()
    }

    /// Snapshot of every buffered call, grouped by operation.
    pub fn to_vec(&self) -> Vec<Arc<CallRecord>> {
        self.lock().values().flatten().cloned().collect()
    }

    /// Operations with at least one buffered call, in first-seen order.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().keys().copied().collect()
    }

    /// Total number of buffered calls, invoked or not.
    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    /// Whether nothing has been buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of buffered calls not yet claimed by an invoker.
    pub fn pending(&self) -> usize {
        self.lock()
            .values()
            .flatten()
            .filter(|record| !record.is_called())
            .count()
    }

    /// Drop every buffered call.
    ///
    /// Callers still waiting on an uninvoked call observe it as abandoned.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CallBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallBuffer")
            .field("operations", &self.operations())
            .field("len", &self.len())
            .finish()
    }
}
