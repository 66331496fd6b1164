//! Testing utilities for code built on the pre-initialization layer.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! preinit = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use preinit::testing::{load_gate, RecordingEngine, Response};
//!
//! let engine = Arc::new(RecordingEngine::new());
//! engine.respond_once(Operation::Track, Response::Reject("offline".into()));
//!
//! let (gate, loader) = load_gate::<RecordingEngine, ()>();
//! let facade = Facade::new(loader)?;
//! let pending = facade.track(vec![json!("signup")]);
//!
//! gate.open(engine.clone(), ());
//! assert_eq!(pending.await.unwrap_err().to_string(), "offline");
//! assert_eq!(engine.count(Operation::Track), 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::buffer::CallBuffer;
use crate::engine::{Engine, Invocation};
use crate::facade::LoadFuture;
use crate::flush::Scheduler;
use crate::operation::Operation;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// RecordingEngine
// =============================================================================

/// A scripted reply for one engine invocation.
#[derive(Debug, Clone)]
pub enum Response {
    /// Return a plain value.
    Value(Value),
    /// Return a pending result that resolves to the value.
    Deferred(Value),
    /// Return a pending result that resolves to the value after a delay.
    Delayed(Duration, Value),
    /// Fail synchronously.
    Throw(String),
    /// Return a pending result that fails.
    Reject(String),
    /// Panic inside `invoke`.
    Panic(String),
}

/// One call the engine received.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Invoked {
    /// The operation that ran.
    pub operation: Operation,
    /// Its positional arguments.
    pub args: Vec<Value>,
}

/// An [`Engine`] that records every invocation in order.
///
/// Without a scripted response it returns [`RecordingEngine::echo`] as a
/// plain value.
#[derive(Debug, Default)]
pub struct RecordingEngine {
    invocations: Mutex<Vec<Invoked>>,
    once: Mutex<HashMap<Operation, VecDeque<Response>>>,
    always: Mutex<HashMap<Operation, Response>>,
}

impl RecordingEngine {
    /// An engine with nothing scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// The default reply: the operation name and its arguments.
    pub fn echo(operation: Operation, args: &[Value]) -> Value {
        json!({ "operation": operation.as_str(), "args": args })
    }

    /// Queue a reply for the next call to `operation`.
    ///
    /// Queued replies are consumed in order before any `respond_always` reply.
    pub fn respond_once(&self, operation: Operation, response: Response) {
        lock(&self.once)
            .entry(operation)
            .or_default()
            .push_back(response);
    }

    /// Reply to every call to `operation` the same way.
    pub fn respond_always(&self, operation: Operation, response: Response) {
        lock(&self.always).insert(operation, response);
    }

    /// Every invocation, in the order the engine received them.
    pub fn invocations(&self) -> Vec<Invoked> {
        lock(&self.invocations).clone()
    }

    /// Number of times `operation` was invoked.
    pub fn count(&self, operation: Operation) -> usize {
        lock(&self.invocations)
            .iter()
            .filter(|invoked| invoked.operation == operation)
            .count()
    }

    /// Arguments of each call to `operation`, in order.
    pub fn args_for(&self, operation: Operation) -> Vec<Vec<Value>> {
        lock(&self.invocations)
            .iter()
            .filter(|invoked| invoked.operation == operation)
            .map(|invoked| invoked.args.clone())
            .collect()
    }

    fn next_response(&self, operation: Operation) -> Option<Response> {
        if let Some(response) = lock(&self.once)
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            return Some(response);
        }
        lock(&self.always).get(&operation).cloned()
    }
}

impl Engine for RecordingEngine {
    fn invoke(&self, operation: Operation, args: Vec<Value>) -> Result<Invocation> {
        lock(&self.invocations).push(Invoked {
            operation,
            args: args.clone(),
        });

        // Every guard is released by now, so a scripted panic poisons nothing.
        match self.next_response(operation) {
            None => Ok(Invocation::Value(Self::echo(operation, &args))),
            Some(Response::Value(value)) => Ok(Invocation::Value(value)),
            Some(Response::Deferred(value)) => Ok(Invocation::pending(async move { Ok(value) })),
            Some(Response::Delayed(delay, value)) => Ok(Invocation::pending(async move {
                tokio::time::sleep(delay).await;
                Ok(value)
            })),
            Some(Response::Throw(reason)) => Err(anyhow!(reason)),
            Some(Response::Reject(reason)) => {
                Ok(Invocation::pending(async move { Err(anyhow!(reason)) }))
            }
            Some(Response::Panic(message)) => panic!("{message}"),
        }
    }
}

// =============================================================================
// ManualScheduler
// =============================================================================

/// A [`Scheduler`] that holds units until the test drains them.
#[derive(Default)]
pub struct ManualScheduler {
    units: Mutex<Vec<BoxFuture<'static, ()>>>,
}

impl ManualScheduler {
    /// A scheduler holding no units.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of units waiting to run.
    pub fn pending(&self) -> usize {
        lock(&self.units).len()
    }

    /// Run every held unit to completion, in scheduling order.
    ///
    /// Units scheduled while draining are run too. Returns how many ran.
    pub async fn run_all(&self) -> usize {
        let mut ran = 0;
        loop {
            let units = std::mem::take(&mut *lock(&self.units));
            if units.is_empty() {
                return ran;
            }
            for unit in units {
                unit.await;
                ran += 1;
            }
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, unit: BoxFuture<'static, ()>) {
        lock(&self.units).push(unit);
    }
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

// =============================================================================
// LoadGate
// =============================================================================

/// Decides when (and whether) a loader built by [`load_gate`] resolves.
///
/// Dropping the gate without opening it rejects the load.
#[derive(Debug)]
pub struct LoadGate<E, C> {
    tx: oneshot::Sender<Result<(Arc<E>, C)>>,
    buffer: Arc<Mutex<Option<Arc<CallBuffer>>>>,
}

impl<E, C> LoadGate<E, C> {
    /// Resolve the load with `engine` and `context`.
    pub fn open(self, engine: Arc<E>, context: C) {
        let _ = self.tx.send(Ok((engine, context)));
    }

    /// Reject the load with `reason`.
    pub fn fail(self, reason: &str) {
        let _ = self.tx.send(Err(anyhow!(reason.to_string())));
    }

    /// The buffer the façade handed to the loader, once it has run.
    pub fn buffer(&self) -> Option<Arc<CallBuffer>> {
        lock(&self.buffer).clone()
    }
}

/// A loader that stays pending until the returned gate is opened or failed.
pub fn load_gate<E, C>() -> (
    LoadGate<E, C>,
    impl FnOnce(Arc<CallBuffer>) -> Result<LoadFuture<E, C>>,
)
where
    E: Send + Sync + 'static,
    C: Send + 'static,
{
    let (tx, rx) = oneshot::channel::<Result<(Arc<E>, C)>>();
    let seen = Arc::new(Mutex::new(None));
    let gate = LoadGate {
        tx,
        buffer: Arc::clone(&seen),
    };
    let loader = move |buffer: Arc<CallBuffer>| -> Result<LoadFuture<E, C>> {
        *lock(&seen) = Some(buffer);
        Ok(async move {
            rx.await
                .unwrap_or_else(|_| Err(anyhow!("load gate dropped before opening")))
        }
        .boxed())
    };
    (gate, loader)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_engine_consumes_scripted_replies_in_order() {
        let engine = RecordingEngine::new();
        engine.respond_once(Operation::Track, Response::Value(json!(1)));
        engine.respond_once(Operation::Track, Response::Value(json!(2)));
        engine.respond_always(Operation::Track, Response::Value(json!("always")));

        let mut seen = Vec::new();
        for _ in 0..4 {
            let value = engine
                .invoke(Operation::Track, vec![])
                .unwrap()
                .resolve()
                .await
                .unwrap();
            seen.push(value);
        }

        assert_eq!(seen, vec![json!(1), json!(2), json!("always"), json!("always")]);
        assert_eq!(engine.count(Operation::Track), 4);
    }

    #[tokio::test]
    async fn test_recording_engine_defaults_to_echo() {
        let engine = RecordingEngine::new();
        let value = engine
            .invoke(Operation::Identify, vec![json!("u1")])
            .unwrap()
            .resolve()
            .await
            .unwrap();
        assert_eq!(value, json!({"operation": "identify", "args": ["u1"]}));
        assert_eq!(engine.args_for(Operation::Identify), vec![vec![json!("u1")]]);
    }

    #[tokio::test]
    async fn test_manual_scheduler_runs_nested_units() {
        let scheduler = Arc::new(ManualScheduler::new());
        let inner = Arc::clone(&scheduler);
        scheduler.schedule(
            async move {
                inner.schedule(async {}.boxed());
            }
            .boxed(),
        );

        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.run_all().await, 2);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_load_gate_open_and_fail() {
        let (gate, loader) = load_gate::<RecordingEngine, &'static str>();
        let future = loader(Arc::new(CallBuffer::new())).unwrap();
        assert!(gate.buffer().is_some());
        gate.open(Arc::new(RecordingEngine::new()), "ctx");
        let (_, ctx) = future.await.unwrap();
        assert_eq!(ctx, "ctx");

        let (gate, loader) = load_gate::<RecordingEngine, ()>();
        let future = loader(Arc::new(CallBuffer::new())).unwrap();
        gate.fail("cannot instantiate");
        assert_eq!(future.await.unwrap_err().to_string(), "cannot instantiate");

        let (gate, loader) = load_gate::<RecordingEngine, ()>();
        let future = loader(Arc::new(CallBuffer::new())).unwrap();
        drop(gate);
        assert!(future.await.is_err());
    }
}
