//! Runs call records against a ready engine, exactly once.
//!
//! The invoker never fails. Whatever the engine does (returns an error,
//! resolves to an error, panics) ends up in the record's own failure path.

use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::Result;
use futures::FutureExt;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::engine::{Engine, Invocation};
use crate::error::{panic_message, PreInitError};
use crate::operation::Operation;
use crate::record::CallRecord;

/// Invoke a record and wait for the engine's result before settling it.
///
/// A record that was already claimed is left untouched: the engine is not
/// reached and neither callback fires.
pub async fn invoke<E: Engine + ?Sized>(engine: &E, record: &CallRecord) {
    invoke_then(engine, record, || {}).await;
}

/// Like [`invoke`], calling `started` as soon as the engine call has begun
/// (or the record turned out to be claimed already), before its result is
/// awaited.
pub(crate) async fn invoke_then<E, F>(engine: &E, record: &CallRecord, started: F)
where
    E: Engine + ?Sized,
    F: FnOnce(),
{
    if !record.mark_called() {
        trace!(call_id = %record.id(), operation = %record.operation(), "already called, skipping");
        started();
        return;
    }

    let operation = record.operation();
    debug!(call_id = %record.id(), %operation, "invoking buffered call");
    let invocation = start(engine, operation, record.args().to_vec());
    started();
    let outcome = match invocation {
        Ok(invocation) => finish(operation, invocation).await,
        Err(err) => Err(err),
    };
    if let Err(err) = &outcome {
        debug!(call_id = %record.id(), operation = %record.operation(), error = %err, "buffered call failed");
    }
    record.settle(outcome);
}

/// Invoke a record without waiting.
///
/// Plain values and synchronous failures settle before this returns. If the
/// engine hands back a pending result, it is driven on the current Tokio
/// runtime as a detached task which settles the record when done.
pub fn invoke_sync<E: Engine + ?Sized>(engine: &E, record: &CallRecord) {
    if !record.mark_called() {
        trace!(call_id = %record.id(), operation = %record.operation(), "already called, skipping");
        return;
    }

    let operation = record.operation();
    debug!(call_id = %record.id(), %operation, "invoking buffered call (sync)");
    match start(engine, operation, record.args().to_vec()) {
        Ok(Invocation::Value(value)) => record.settle(Ok(value)),
        Ok(pending @ Invocation::Pending(_)) => {
            let settlement = record.take_settlement();
            match Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        settlement.settle(finish(operation, pending).await);
                    });
                }
                Err(_) => settlement.settle(Err(PreInitError::NoRuntime.into())),
            }
        }
        Err(err) => record.settle(Err(err)),
    }
}

/// Start an engine call, turning a panic into an error.
pub(crate) fn start<E: Engine + ?Sized>(
    engine: &E,
    operation: Operation,
    args: Vec<Value>,
) -> Result<Invocation> {
    match catch_unwind(AssertUnwindSafe(|| engine.invoke(operation, args))) {
        Ok(result) => result,
        Err(payload) => Err(PreInitError::EnginePanicked {
            operation,
            message: panic_message(&*payload),
        }
        .into()),
    }
}

/// Wait for a started engine call, turning a panic into an error.
pub(crate) async fn finish(operation: Operation, invocation: Invocation) -> Result<Value> {
    match invocation {
        Invocation::Value(value) => Ok(value),
        Invocation::Pending(future) => match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(PreInitError::EnginePanicked {
                operation,
                message: panic_message(&*payload),
            }
            .into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingEngine, Response};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default, Clone)]
    struct Outcomes {
        ok: Arc<Mutex<Vec<Value>>>,
        err: Arc<Mutex<Vec<String>>>,
    }

    impl Outcomes {
        fn record(&self, operation: Operation, args: Vec<Value>) -> CallRecord {
            let ok = self.ok.clone();
            let err = self.err.clone();
            CallRecord::new(
                operation,
                args,
                move |v| ok.lock().unwrap().push(v),
                move |e| err.lock().unwrap().push(e.to_string()),
            )
        }

        fn ok(&self) -> Vec<Value> {
            self.ok.lock().unwrap().clone()
        }

        fn err(&self) -> Vec<String> {
            self.err.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_invoke_marks_record_called() {
        let engine = RecordingEngine::new();
        let outcomes = Outcomes::default();
        let record = outcomes.record(Operation::Track, vec![json!("foo"), json!({})]);

        invoke(&engine, &record).await;

        assert!(record.is_called());
    }

    #[tokio::test]
    async fn test_invoke_settles_success_with_engine_value() {
        let engine = RecordingEngine::new();
        engine.respond_once(Operation::Track, Response::Deferred(json!("ctx")));
        let outcomes = Outcomes::default();
        let record = outcomes.record(Operation::Track, vec![json!("foo")]);

        invoke(&engine, &record).await;

        assert_eq!(outcomes.ok(), vec![json!("ctx")]);
        assert!(outcomes.err().is_empty());
        assert_eq!(engine.args_for(Operation::Track), vec![vec![json!("foo")]]);
    }

    #[tokio::test]
    async fn test_invoke_routes_sync_failure_to_failure_callback() {
        let engine = RecordingEngine::new();
        engine.respond_once(Operation::Track, Response::Throw("foo".into()));
        let outcomes = Outcomes::default();
        let record = outcomes.record(Operation::Track, vec![json!("foo"), json!({})]);

        // Must not panic or propagate.
        invoke(&engine, &record).await;

        assert!(outcomes.ok().is_empty());
        assert_eq!(outcomes.err(), vec!["foo".to_string()]);
    }

    #[tokio::test]
    async fn test_invoke_routes_async_rejection_to_failure_callback() {
        let engine = RecordingEngine::new();
        engine.respond_once(Operation::Identify, Response::Reject("offline".into()));
        let outcomes = Outcomes::default();
        let record = outcomes.record(Operation::Identify, vec![json!("user-1")]);

        invoke(&engine, &record).await;

        assert!(outcomes.ok().is_empty());
        assert_eq!(outcomes.err(), vec!["offline".to_string()]);
    }

    #[tokio::test]
    async fn test_invoke_skips_record_already_called() {
        let engine = RecordingEngine::new();
        let outcomes = Outcomes::default();
        let record = outcomes.record(Operation::Track, vec![json!("foo")]);
        assert!(record.mark_called());

        invoke(&engine, &record).await;

        assert_eq!(engine.count(Operation::Track), 0);
        assert!(outcomes.ok().is_empty());
        assert!(outcomes.err().is_empty());
    }

    #[tokio::test]
    async fn test_invoke_twice_reaches_engine_once() {
        let engine = RecordingEngine::new();
        let outcomes = Outcomes::default();
        let record = outcomes.record(Operation::Page, vec![]);

        invoke(&engine, &record).await;
        invoke(&engine, &record).await;
        invoke_sync(&engine, &record);

        assert_eq!(engine.count(Operation::Page), 1);
        assert_eq!(outcomes.ok().len(), 1);
        assert!(outcomes.err().is_empty());
    }

    #[tokio::test]
    async fn test_invoke_converts_engine_panic_into_failure() {
        let engine = RecordingEngine::new();
        engine.respond_once(Operation::Alias, Response::Panic("kaboom".into()));
        let outcomes = Outcomes::default();
        let record = outcomes.record(Operation::Alias, vec![]);

        invoke(&engine, &record).await;

        let errors = outcomes.err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("kaboom"), "got: {}", errors[0]);
    }

    #[tokio::test]
    async fn test_invoke_sync_settles_plain_value_immediately() {
        let engine = RecordingEngine::new();
        let outcomes = Outcomes::default();
        let record = outcomes.record(Operation::On, vec![json!("ready")]);

        invoke_sync(&engine, &record);

        assert_eq!(
            outcomes.ok(),
            vec![RecordingEngine::echo(Operation::On, &[json!("ready")])]
        );
    }

    #[tokio::test]
    async fn test_invoke_sync_routes_sync_failure() {
        let engine = RecordingEngine::new();
        engine.respond_once(Operation::SetAnonymousId, Response::Throw("bad id".into()));
        let outcomes = Outcomes::default();
        let record = outcomes.record(Operation::SetAnonymousId, vec![json!(42)]);

        invoke_sync(&engine, &record);

        assert_eq!(outcomes.err(), vec!["bad id".to_string()]);
    }

    #[tokio::test]
    async fn test_invoke_sync_drives_pending_result_in_background() {
        let engine = RecordingEngine::new();
        engine.respond_once(
            Operation::SetAnonymousId,
            Response::Delayed(Duration::from_millis(20), json!("anon-1")),
        );
        let (tx, rx) = tokio::sync::oneshot::channel();
        let record = CallRecord::new(
            Operation::SetAnonymousId,
            vec![json!("anon-1")],
            move |v| {
                let _ = tx.send(v);
            },
            |e| panic!("unexpected failure: {e}"),
        );

        invoke_sync(&engine, &record);
        assert_eq!(engine.count(Operation::SetAnonymousId), 1);

        let value = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("settled in time")
            .unwrap();
        assert_eq!(value, json!("anon-1"));
    }

    #[tokio::test]
    async fn test_invoke_then_signals_start_before_result() {
        let engine = RecordingEngine::new();
        engine.respond_once(
            Operation::Group,
            Response::Delayed(Duration::from_millis(20), json!("grouped")),
        );
        let outcomes = Outcomes::default();
        let record = outcomes.record(Operation::Group, vec![]);
        let (tx, rx) = tokio::sync::oneshot::channel();

        let invocation = invoke_then(&engine, &record, move || {
            let _ = tx.send(());
        });
        tokio::pin!(invocation);
        tokio::select! {
            _ = &mut invocation => panic!("settled before the start signal"),
            started = rx => started.unwrap(),
        }
        assert_eq!(engine.count(Operation::Group), 1);
        assert!(outcomes.ok().is_empty());

        invocation.await;
        assert_eq!(outcomes.ok(), vec![json!("grouped")]);
    }

    #[tokio::test]
    async fn test_invoke_then_signals_for_claimed_record() {
        let engine = RecordingEngine::new();
        let record = CallRecord::detached(Operation::Page, vec![]);
        assert!(record.mark_called());
        let mut signalled = false;

        invoke_then(&engine, &record, || signalled = true).await;

        assert!(signalled);
        assert_eq!(engine.count(Operation::Page), 0);
    }
}
