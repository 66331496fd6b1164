//! Flush strategies: draining buffered calls once the engine is ready.
//!
//! Three strategies exist because operations differ in whether their order
//! relative to *other* operations matters:
//!
//! | Strategy     | Runs                             | Use for                          |
//! |--------------|----------------------------------|----------------------------------|
//! | Sequential   | one at a time, each awaited      | middleware registration          |
//! | Replay       | in order, inline, nothing awaited| listeners, identity resets       |
//! | Scheduled    | one task per call, started FIFO  | everything else                  |
//!
//! Only order *within* one operation's list is guaranteed. A [`FlushPlan`]
//! composes the strategies and designates exactly one of them per operation.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{self, join_all, BoxFuture};
use futures::FutureExt;
use indexmap::IndexMap;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::debug;

use crate::buffer::CallBuffer;
use crate::engine::Engine;
use crate::error::PreInitError;
use crate::invoke::{invoke, invoke_sync, invoke_then};
use crate::operation::Operation;
use crate::record::CallRecord;

// =============================================================================
// Scheduler
// =============================================================================

/// Hands independent units of work to the host's task scheduler.
///
/// A unit must never run inline inside `schedule`.
pub trait Scheduler: Send + Sync {
    /// Run `unit` later, independently of the caller.
    fn schedule(&self, unit: BoxFuture<'static, ()>);
}

/// Schedules each unit as its own Tokio task.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Schedule onto the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Schedule onto the runtime this is called from.
    pub fn current() -> Result<Self, PreInitError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| PreInitError::NoRuntime)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, unit: BoxFuture<'static, ()>) {
        // Dropping the JoinHandle detaches the task; a panic stays inside it.
        drop(self.handle.spawn(unit));
    }
}

// =============================================================================
// Strategies
// =============================================================================

/// Invoke every buffered call to `operation` in order, awaiting each one.
///
/// A failing call settles its own failure path and the next call still runs.
pub async fn flush_sequential<E: Engine + ?Sized>(
    engine: &E,
    buffer: &CallBuffer,
    operation: Operation,
) {
    let calls = buffer.get_calls(operation);
    if calls.is_empty() {
        return;
    }
    debug!(%operation, count = calls.len(), "flushing sequentially");
    for call in &calls {
        invoke(engine, call).await;
    }
}

/// Invoke every buffered call to `operation` in order, without awaiting.
pub fn flush_replay<E: Engine + ?Sized>(engine: &E, buffer: &CallBuffer, operation: Operation) {
    let calls = buffer.get_calls(operation);
    if calls.is_empty() {
        return;
    }
    debug!(%operation, count = calls.len(), "replaying");
    for call in &calls {
        invoke_sync(engine, call);
    }
}

/// Schedule each call as an independent unit of work.
///
/// Nothing runs inline. Units for one operation start their calls in
/// arrival order, but none waits for another's result, so a slow, failing or
/// panicking call cannot keep the others from running. Calls already claimed
/// are not scheduled again.
///
/// The returned [`Started`] resolves once every scheduled call has reached
/// the engine. Dropping it leaves the units running.
pub fn flush_scheduled<E: Engine>(
    engine: &Arc<E>,
    calls: Vec<Arc<CallRecord>>,
    scheduler: &dyn Scheduler,
) -> Started {
    let mut last: IndexMap<Operation, oneshot::Receiver<()>> = IndexMap::new();
    let mut scheduled = 0;
    for call in calls.into_iter().filter(|call| !call.is_called()) {
        let (started, next) = oneshot::channel();
        let previous = last.insert(call.operation(), next);
        let engine = Arc::clone(engine);
        scheduler.schedule(
            async move {
                if let Some(previous) = previous {
                    // A dropped predecessor never starts; go ahead anyway.
                    let _ = previous.await;
                }
                invoke_then(engine.as_ref(), &call, move || {
                    let _ = started.send(());
                })
                .await;
            }
            .boxed(),
        );
        scheduled += 1;
    }
    if scheduled > 0 {
        debug!(count = scheduled, operations = last.len(), "scheduled buffered calls");
    }

    // The last unit of each operation starts after all earlier ones.
    Started {
        inner: join_all(last.into_values()).map(drop).boxed(),
    }
}

/// Schedule every buffered call, across all operations.
pub fn flush_in_new_task<E: Engine>(
    engine: &Arc<E>,
    buffer: &CallBuffer,
    scheduler: &dyn Scheduler,
) -> Started {
    flush_scheduled(engine, buffer.to_vec(), scheduler)
}

/// Resolves once every call a flush scheduled has reached the engine.
///
/// Their results may still be pending.
pub struct Started {
    inner: BoxFuture<'static, ()>,
}

impl Started {
    fn nothing() -> Self {
        Self {
            inner: future::ready(()).boxed(),
        }
    }
}

impl Future for Started {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.inner.poll_unpin(cx)
    }
}

impl fmt::Debug for Started {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Started(..)")
    }
}

// =============================================================================
// Flush Plan
// =============================================================================

/// One step of a flush plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStep {
    /// Drain one operation with [`flush_sequential`].
    Sequential(Operation),
    /// Drain one operation with [`flush_replay`].
    Replay(Operation),
    /// Schedule every operation not designated by another step.
    Scheduled,
}

/// An ordered set of flush steps, each operation designated to exactly one.
///
/// # Example
///
/// ```ignore
/// let plan = FlushPlan::new()
///     .sequential(Operation::AddSourceMiddleware)?
///     .replay(Operation::On)?
///     .scheduled()?;
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushPlan {
    steps: Vec<FlushStep>,
}

impl FlushPlan {
    /// An empty plan. Flushes nothing; the loader is expected to flush.
    pub fn new() -> Self {
        Self::default()
    }

    /// Alias for [`FlushPlan::new`], for readability at call sites.
    pub fn none() -> Self {
        Self::new()
    }

    /// Middleware first, then listeners, then anonymous ids, then the rest.
    pub fn standard() -> Self {
        Self {
            steps: vec![
                FlushStep::Sequential(Operation::AddSourceMiddleware),
                FlushStep::Replay(Operation::On),
                FlushStep::Replay(Operation::SetAnonymousId),
                FlushStep::Scheduled,
            ],
        }
    }

    /// Add a sequential step for `operation`.
    pub fn sequential(self, operation: Operation) -> Result<Self, PreInitError> {
        self.designate(FlushStep::Sequential(operation), operation)
    }

    /// Add a replay step for `operation`.
    pub fn replay(self, operation: Operation) -> Result<Self, PreInitError> {
        self.designate(FlushStep::Replay(operation), operation)
    }

    /// Add the scheduled step for all remaining operations.
    pub fn scheduled(mut self) -> Result<Self, PreInitError> {
        if self.steps.contains(&FlushStep::Scheduled) {
            return Err(PreInitError::DuplicateScheduledStep);
        }
        self.steps.push(FlushStep::Scheduled);
        Ok(self)
    }

    /// The steps, in execution order.
    pub fn steps(&self) -> &[FlushStep] {
        &self.steps
    }

    /// Whether the plan flushes nothing.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Operations drained by a sequential or replay step.
    pub fn designated(&self) -> Vec<Operation> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                FlushStep::Sequential(op) | FlushStep::Replay(op) => Some(*op),
                FlushStep::Scheduled => None,
            })
            .collect()
    }

    /// Execute every step against `buffer`, in order.
    ///
    /// Sequential and replay steps are done when this returns. The returned
    /// [`Started`] covers the scheduled step.
    pub async fn run<E: Engine>(
        &self,
        engine: &Arc<E>,
        buffer: &CallBuffer,
        scheduler: &dyn Scheduler,
    ) -> Started {
        let designated = self.designated();
        let mut started = Started::nothing();
        for step in &self.steps {
            match *step {
                FlushStep::Sequential(op) => flush_sequential(engine.as_ref(), buffer, op).await,
                FlushStep::Replay(op) => flush_replay(engine.as_ref(), buffer, op),
                FlushStep::Scheduled => {
                    let remaining = buffer
                        .to_vec()
                        .into_iter()
                        .filter(|call| !designated.contains(&call.operation()))
                        .collect();
                    started = flush_scheduled(engine, remaining, scheduler);
                }
            }
        }
        started
    }

    fn designate(mut self, step: FlushStep, operation: Operation) -> Result<Self, PreInitError> {
        if self.designated().contains(&operation) {
            return Err(PreInitError::DuplicateFlushStep { operation });
        }
        self.steps.push(step);
        Ok(self)
    }
}
