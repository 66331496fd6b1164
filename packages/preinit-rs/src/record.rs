//! Call records: one deferred operation invocation and how to settle it.
//!
//! A record is created when a caller invokes an operation before the engine
//! is ready, or when a snippet entry is normalized. Only the invoker mutates
//! it: it flips `called` exactly once and fires exactly one of the two
//! completion paths.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

use crate::error::panic_message;
use crate::operation::Operation;

/// Success callback for a call record.
pub type OnSuccess = Box<dyn FnOnce(Value) + Send + 'static>;

/// Failure callback for a call record.
pub type OnFailure = Box<dyn FnOnce(anyhow::Error) + Send + 'static>;

/// Where a record's outcome goes.
enum Settler {
    Callbacks {
        on_success: OnSuccess,
        on_failure: OnFailure,
    },
    /// The façade's own buffered calls reply on a channel. Dropping the
    /// record unsettled drops the sender, which the waiting caller observes.
    Reply(oneshot::Sender<Result<Value>>),
}

/// A buffered invocation of one deferrable operation.
pub struct CallRecord {
    id: Uuid,
    operation: Operation,
    args: Vec<Value>,
    called: AtomicBool,
    settler: Mutex<Option<Settler>>,
}

impl CallRecord {
    /// Create a record that settles through the given callbacks.
    pub fn new<S, F>(operation: Operation, args: Vec<Value>, on_success: S, on_failure: F) -> Self
    where
        S: FnOnce(Value) + Send + 'static,
        F: FnOnce(anyhow::Error) + Send + 'static,
    {
        Self::with_settler(
            operation,
            args,
            Settler::Callbacks {
                on_success: Box::new(on_success),
                on_failure: Box::new(on_failure),
            },
        )
    }

    /// Create a record nobody waits on: success is ignored, failure is logged.
    ///
    /// Used for chainable operations and snippet entries, whose original
    /// callers hold no handle to receive a result.
    pub fn detached(operation: Operation, args: Vec<Value>) -> Self {
        let id = Uuid::new_v4();
        Self::with_id(
            id,
            operation,
            args,
            Settler::Callbacks {
                on_success: Box::new(|_| {}),
                on_failure: Box::new(move |err| {
                    warn!(call_id = %id, %operation, error = %err, "deferred call failed");
                }),
            },
        )
    }

    /// Create a record whose outcome is delivered on a channel.
    pub(crate) fn with_reply(
        operation: Operation,
        args: Vec<Value>,
    ) -> (Self, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        (Self::with_settler(operation, args, Settler::Reply(tx)), rx)
    }

    fn with_settler(operation: Operation, args: Vec<Value>, settler: Settler) -> Self {
        Self::with_id(Uuid::new_v4(), operation, args, settler)
    }

    fn with_id(id: Uuid, operation: Operation, args: Vec<Value>, settler: Settler) -> Self {
        Self {
            id,
            operation,
            args,
            called: AtomicBool::new(false),
            settler: Mutex::new(Some(settler)),
        }
    }

    /// Random id used to correlate log lines for this record.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The operation this record invokes.
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Positional arguments, in call order.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Whether an invocation attempt has already claimed this record.
    pub fn is_called(&self) -> bool {
        self.called.load(Ordering::Acquire)
    }

    /// Claim the record for invocation.
    ///
    /// Returns `true` for exactly one caller, ever. Every later call (from any
    /// thread) returns `false`.
    pub fn mark_called(&self) -> bool {
        !self.called.swap(true, Ordering::AcqRel)
    }

    /// Detach the completion path so it can move into another task.
    pub(crate) fn take_settlement(&self) -> Settlement {
        Settlement {
            id: self.id,
            operation: self.operation,
            settler: self.take_settler(),
        }
    }

    pub(crate) fn settle(&self, outcome: Result<Value>) {
        self.take_settlement().settle(outcome);
    }

    fn take_settler(&self) -> Option<Settler> {
        self.settler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl fmt::Debug for CallRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRecord")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("args", &self.args)
            .field("called", &self.is_called())
            .finish_non_exhaustive()
    }
}

/// The completion path of one record, detached from the record itself.
///
/// Settling consumes it, so at most one of success/failure ever fires.
pub(crate) struct Settlement {
    id: Uuid,
    operation: Operation,
    settler: Option<Settler>,
}

impl Settlement {
    pub(crate) fn settle(self, outcome: Result<Value>) {
        let Some(settler) = self.settler else {
            return;
        };
        let callbacks = match (settler, outcome) {
            (Settler::Callbacks { on_success, .. }, Ok(value)) => {
                catch_unwind(AssertUnwindSafe(|| on_success(value)))
            }
            (Settler::Callbacks { on_failure, .. }, Err(err)) => {
                catch_unwind(AssertUnwindSafe(|| on_failure(err)))
            }
            (Settler::Reply(tx), outcome) => {
                // Receiver gone means the caller dropped its pending result.
                if tx.send(outcome).is_err() {
                    tracing::trace!(
                        call_id = %self.id,
                        operation = %self.operation,
                        "pending result dropped before settlement"
                    );
                }
                Ok(())
            }
        };
        // A panicking callback only takes down its own record.
        if let Err(payload) = callbacks {
            warn!(
                call_id = %self.id,
                operation = %self.operation,
                panic = %panic_message(&*payload),
                "completion callback panicked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_mark_called_claims_once() {
        let record = CallRecord::detached(Operation::Track, vec![]);
        assert!(!record.is_called());
        assert!(record.mark_called());
        assert!(record.is_called());
        assert!(!record.mark_called());
    }

    #[test]
    fn test_mark_called_claims_once_across_threads() {
        let record = Arc::new(CallRecord::detached(Operation::Track, vec![]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let record = record.clone();
                std::thread::spawn(move || record.mark_called())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_settle_fires_only_first_outcome() {
        let successes = Arc::new(Mutex::new(Vec::new()));
        let failures = Arc::new(Mutex::new(Vec::new()));
        let (s, f) = (successes.clone(), failures.clone());
        let record = CallRecord::new(
            Operation::Identify,
            vec![Value::from("user-1")],
            move |v| s.lock().unwrap().push(v),
            move |e| f.lock().unwrap().push(e.to_string()),
        );

        record.settle(Ok(Value::from(1)));
        record.settle(Err(anyhow::anyhow!("late failure")));

        assert_eq!(*successes.lock().unwrap(), vec![Value::from(1)]);
        assert!(failures.lock().unwrap().is_empty());
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let record = CallRecord::new(
            Operation::Track,
            vec![],
            |_| panic!("callback exploded"),
            |_| {},
        );
        record.settle(Ok(Value::Null));

        let record = CallRecord::new(
            Operation::Track,
            vec![],
            |_| {},
            |_| panic!("failure handler exploded"),
        );
        record.settle(Err(anyhow::anyhow!("engine down")));
    }

    #[tokio::test]
    async fn test_reply_record_delivers_outcome() {
        let (record, rx) = CallRecord::with_reply(Operation::Page, vec![]);
        record.settle(Ok(Value::from("done")));
        assert_eq!(rx.await.unwrap().unwrap(), Value::from("done"));
    }

    #[tokio::test]
    async fn test_dropping_reply_record_closes_channel() {
        let (record, rx) = CallRecord::with_reply(Operation::Page, vec![]);
        drop(record);
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_debug_omits_callbacks() {
        let record = CallRecord::detached(Operation::Alias, vec![Value::from("a")]);
        let debug = format!("{:?}", record);
        assert!(debug.contains("Alias"));
        assert!(debug.contains("called: false"));
    }
}
