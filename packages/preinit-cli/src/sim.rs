//! An in-memory engine that logs what it is asked to do.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use preinit::inspector::{InspectorHost, TraceEvent};
use preinit::{CallBuffer, CallKind, Engine, Invocation, LoadFuture, Operation, Scheduler};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Integrations the simulated engine pretends to deliver to.
pub const INTEGRATIONS: &[&str] = &["Console", "Warehouse"];

/// One line of the invocation log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub seq: usize,
    pub operation: Operation,
    pub args: Vec<Value>,
    pub at: DateTime<Utc>,
}

/// Records every invocation and reports event activity to an inspector host.
pub struct SimEngine {
    log: Mutex<Vec<LogEntry>>,
    host: Arc<InspectorHost>,
    latency: Duration,
}

impl SimEngine {
    pub fn new(host: Arc<InspectorHost>, latency: Duration) -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            host,
            latency,
        }
    }

    /// The invocation log, in the order calls reached the engine.
    pub fn log(&self) -> Vec<LogEntry> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Engine for SimEngine {
    fn invoke(&self, operation: Operation, args: Vec<Value>) -> Result<Invocation> {
        {
            let mut log = self.lock();
            let seq = log.len();
            log.push(LogEntry {
                seq,
                operation,
                args: args.clone(),
                at: Utc::now(),
            });
        }

        if operation.kind() == CallKind::Chainable {
            return Ok(Invocation::value(Value::Null));
        }

        let event = TraceEvent::new(
            Uuid::new_v4().to_string(),
            json!({ "type": operation.as_str(), "args": args }),
        );
        self.host.report_triggered(&event);

        let host = Arc::clone(&self.host);
        let latency = self.latency;
        Ok(Invocation::pending(async move {
            tokio::time::sleep(latency).await;
            host.report_delivered(&event);
            Ok(json!({ "id": event.id, "event": event.event }))
        }))
    }
}

/// What the simulated loader resolves alongside the engine.
#[derive(Debug, Clone, Serialize)]
pub struct SimContext {
    pub loaded_at: DateTime<Utc>,
    /// Calls waiting in the buffer when loading finished.
    pub buffered: usize,
}

/// A loader that becomes ready after `delay`, or fails if `fail` is set.
pub fn sim_loader(
    engine: Arc<SimEngine>,
    delay: Duration,
    fail: bool,
) -> impl FnOnce(Arc<CallBuffer>) -> Result<LoadFuture<SimEngine, SimContext>> {
    move |buffer| {
        Ok(async move {
            tokio::time::sleep(delay).await;
            if fail {
                return Err(anyhow!("simulated engine failed to load"));
            }
            let context = SimContext {
                loaded_at: Utc::now(),
                buffered: buffer.pending(),
            };
            info!(buffered = context.buffered, "simulated engine loaded");
            Ok((engine, context))
        }
        .boxed())
    }
}

/// Spawns units on Tokio and keeps their handles so they can be awaited.
pub struct TrackedScheduler {
    runtime: Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TrackedScheduler {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Wait for every unit scheduled so far, and any they schedule.
    pub async fn drain(&self) -> usize {
        let mut drained = 0;
        loop {
            let tasks = std::mem::take(
                &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
            );
            if tasks.is_empty() {
                return drained;
            }
            for task in tasks {
                if let Err(err) = task.await {
                    debug!(error = %err, "scheduled unit did not finish");
                }
                drained += 1;
            }
        }
    }
}

impl Scheduler for TrackedScheduler {
    fn schedule(&self, unit: BoxFuture<'static, ()>) {
        let task = self.runtime.spawn(unit);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }
}
