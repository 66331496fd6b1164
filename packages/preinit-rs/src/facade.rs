//! The buffered façade: a stand-in for an engine that is still loading.
//!
//! ```text
//!   caller ──track()──► Facade ──ready?──yes──► Engine (direct)
//!                          │
//!                          no
//!                          ▼
//!                     CallBuffer ◄── snippet records (seeded)
//!                          │
//!            loader resolves (engine, context)
//!                          ▼
//!                  readiness driver ──► FlushPlan::run ──► Engine
//! ```
//!
//! The façade owns one [`CallBuffer`] and one shared loader result. A
//! background task (the readiness driver) awaits that result and runs the
//! flush plan while callers keep buffering. Once a pass has started every
//! buffered call and nothing new arrived meanwhile, it caches the engine under
//! a gate lock. Calls check readiness under the same lock, so a call issued
//! after readiness can never overtake a buffered call to the same operation.
//!
//! Chains over the façade (`then`, `catch`, awaiting `&Facade`) resolve only
//! after that point, so code that awaited readiness talks to the engine
//! directly.
//!
//! Operation dispatch is a single routine driven by [`Operation::kind`]; the
//! named methods (`track`, `identify`, `on`, ...) are generated thin wrappers.

use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::task::{Context, Poll};

use anyhow::Result;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::buffer::CallBuffer;
use crate::chain::Chain;
use crate::config::PreInitConfig;
use crate::engine::Engine;
use crate::error::{LoadError, PreInitError};
use crate::flush::{FlushPlan, Scheduler, TokioScheduler};
use crate::invoke::{finish, invoke_sync, start};
use crate::operation::{CallKind, Operation};
use crate::record::CallRecord;
use crate::snippet::import_snippet;

/// What a loader hands back: a future of the engine and its context.
pub type LoadFuture<E, C> = BoxFuture<'static, Result<(Arc<E>, C)>>;

/// The engine and context, once loaded.
pub type Loaded<E, C> = (Arc<E>, Arc<C>);

type SharedLoad<E, C> = Shared<BoxFuture<'static, Result<Loaded<E, C>, LoadError>>>;

// =============================================================================
// PendingCall
// =============================================================================

/// The pending result of a deferred operation.
///
/// Settles with the engine's return value or failure. A buffered call
/// settles only when a flush runs it; dropping this handle does not cancel
/// the invocation.
#[must_use = "dropping a pending call discards its result, not the call"]
pub struct PendingCall {
    inner: BoxFuture<'static, Result<Value>>,
}

impl PendingCall {
    /// Start the engine call now and resolve with its outcome.
    fn direct<E: Engine + ?Sized>(engine: &E, operation: Operation, args: Vec<Value>) -> Self {
        let started = start(engine, operation, args);
        Self {
            inner: async move { finish(operation, started?).await }.boxed(),
        }
    }

    /// Resolve with whatever the flush delivers on `reply`.
    fn buffered(
        operation: Operation,
        reply: tokio::sync::oneshot::Receiver<Result<Value>>,
    ) -> Self {
        Self {
            inner: async move {
                match reply.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(PreInitError::Abandoned { operation }.into()),
                }
            }
            .boxed(),
        }
    }
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PendingCall(..)")
    }
}

/// What [`Facade::dispatch`] hands back, by the operation's [`CallKind`].
#[must_use]
pub enum Dispatched<'a, E, C> {
    /// A deferred operation's pending result.
    Pending(PendingCall),
    /// The façade itself, for chaining.
    Chained(&'a Facade<E, C>),
    /// Nothing to observe.
    Fired,
}

impl<E, C> Dispatched<'_, E, C> {
    /// The pending result, if the operation was deferred.
    pub fn into_pending(self) -> Option<PendingCall> {
        match self {
            Self::Pending(call) => Some(call),
            Self::Chained(_) | Self::Fired => None,
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for configuring a [`Facade`].
///
/// # Example
///
/// ```ignore
/// let facade = FacadeBuilder::from_config(&PreInitConfig::from_env()?)
///     .scheduler(my_scheduler)
///     .build(|buffer| Ok(load_engine(buffer).boxed()))?;
/// ```
pub struct FacadeBuilder {
    plan: FlushPlan,
    scheduler: Option<Arc<dyn Scheduler>>,
    seed: Vec<CallRecord>,
}

impl Default for FacadeBuilder {
    fn default() -> Self {
        Self {
            plan: FlushPlan::standard(),
            scheduler: None,
            seed: Vec::new(),
        }
    }
}

impl FacadeBuilder {
    /// Standard flush plan, Tokio scheduling, nothing seeded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply configuration: flush mode, and the snippet import if enabled.
    pub fn from_config(config: &PreInitConfig) -> Self {
        let mut builder = Self::new().flush_plan(config.flush.plan());
        if config.import_snippet {
            builder = builder.seed(import_snippet(config));
        }
        builder
    }

    /// Replace the flush plan run at readiness.
    pub fn flush_plan(mut self, plan: FlushPlan) -> Self {
        self.plan = plan;
        self
    }

    /// Replace the scheduler used by the plan's scheduled step.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Records pushed into the buffer before the loader runs.
    pub fn seed<I>(mut self, records: I) -> Self
    where
        I: IntoIterator<Item = CallRecord>,
    {
        self.seed.extend(records);
        self
    }

    /// Create the façade and start driving `loader` to readiness.
    ///
    /// Never blocks. Fails with [`PreInitError::NoRuntime`] outside a Tokio
    /// runtime, or with the loader's own error if it fails synchronously.
    pub fn build<E, C, L>(self, loader: L) -> Result<Facade<E, C>>
    where
        E: Engine,
        C: Send + Sync + 'static,
        L: FnOnce(Arc<CallBuffer>) -> Result<LoadFuture<E, C>>,
    {
        let runtime = Handle::try_current().map_err(|_| PreInitError::NoRuntime)?;

        let buffer = Arc::new(CallBuffer::new());
        if !self.seed.is_empty() {
            debug!(count = self.seed.len(), "seeding buffer with snippet calls");
            buffer.extend(self.seed);
        }

        let load: SharedLoad<E, C> = loader(Arc::clone(&buffer))?
            .map(|loaded| {
                loaded
                    .map(|(engine, context)| (engine, Arc::new(context)))
                    .map_err(LoadError::from)
            })
            .boxed()
            .shared();

        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(TokioScheduler::new(runtime.clone())));
        let (published, mut readiness) = watch::channel(false);

        let settled = {
            let load = load.clone();
            async move {
                let loaded = load.await?;
                if readiness.wait_for(|ready| *ready).await.is_err() {
                    trace!("façade dropped before it became ready");
                }
                Ok::<_, LoadError>(loaded)
            }
            .boxed()
            .shared()
        };

        let inner = Arc::new(Inner {
            buffer,
            ready: OnceLock::new(),
            gate: Mutex::new(()),
            settled,
            runtime: runtime.clone(),
            published,
        });

        drop(runtime.spawn(drive(Arc::downgrade(&inner), load, self.plan, scheduler)));
        trace!("façade created, waiting for engine");

        Ok(Facade { inner })
    }
}

impl fmt::Debug for FacadeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FacadeBuilder")
            .field("plan", &self.plan)
            .field("custom_scheduler", &self.scheduler.is_some())
            .field("seed", &self.seed.len())
            .finish()
    }
}

// =============================================================================
// Facade
// =============================================================================

struct Inner<E, C> {
    buffer: Arc<CallBuffer>,
    ready: OnceLock<Loaded<E, C>>,
    /// Held while checking readiness and buffering, and while caching the
    /// engine. Nothing async happens under it.
    gate: Mutex<()>,
    /// The loader's result, settling only once `ready` is set.
    settled: SharedLoad<E, C>,
    runtime: Handle,
    published: watch::Sender<bool>,
}

impl<E, C> Inner<E, C> {
    fn gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Route<E, R> {
    Direct(Arc<E>, Vec<Value>),
    Buffered(R),
}

/// Accepts engine operations before the engine exists.
///
/// Cheap to clone; clones share the buffer and the loader result.
pub struct Facade<E, C = ()> {
    inner: Arc<Inner<E, C>>,
}

impl<E, C> Clone for Facade<E, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Engine, C: Send + Sync + 'static> Facade<E, C> {
    /// Create a façade with the default builder settings.
    pub fn new<L>(loader: L) -> Result<Self>
    where
        L: FnOnce(Arc<CallBuffer>) -> Result<LoadFuture<E, C>>,
    {
        FacadeBuilder::new().build(loader)
    }

    /// Start configuring a façade.
    pub fn builder() -> FacadeBuilder {
        FacadeBuilder::new()
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Invoke a deferred operation.
    ///
    /// Once ready, the engine is called right away. Before that, the call is
    /// buffered and the result settles when the flush runs it.
    pub fn call(&self, operation: Operation, args: Vec<Value>) -> PendingCall {
        let routed = self.route(args, |buffer, args| {
            let (record, reply) = CallRecord::with_reply(operation, args);
            let record = buffer.push(record);
            trace!(call_id = %record.id(), %operation, "buffered call");
            reply
        });
        match routed {
            Route::Direct(engine, args) => PendingCall::direct(engine.as_ref(), operation, args),
            Route::Buffered(reply) => PendingCall::buffered(operation, reply),
        }
    }

    /// Invoke a chainable operation and return the façade.
    ///
    /// The outcome is not observable; failures are logged.
    pub fn call_chainable(&self, operation: Operation, args: Vec<Value>) -> &Self {
        let routed = self.route(args, |buffer, args| {
            let record = buffer.push(CallRecord::detached(operation, args));
            trace!(call_id = %record.id(), %operation, "buffered chainable call");
        });
        if let Route::Direct(engine, args) = routed {
            let _runtime = self.inner.runtime.enter();
            invoke_sync(engine.as_ref(), &CallRecord::detached(operation, args));
        }
        self
    }

    /// Invoke an operation without keeping a handle to its result.
    pub fn fire(&self, operation: Operation, args: Vec<Value>) {
        let pending = self.call(operation, args);
        drop(self.inner.runtime.spawn(async move {
            if let Err(err) = pending.await {
                warn!(%operation, error = %err, "fire-and-forget call failed");
            }
        }));
    }

    /// Invoke any operation, proxied according to its [`CallKind`].
    pub fn dispatch(&self, operation: Operation, args: Vec<Value>) -> Dispatched<'_, E, C> {
        match operation.kind() {
            CallKind::Deferred => Dispatched::Pending(self.call(operation, args)),
            CallKind::Chainable => Dispatched::Chained(self.call_chainable(operation, args)),
            CallKind::FireAndForget => {
                self.fire(operation, args);
                Dispatched::Fired
            }
        }
    }

    fn route<R>(
        &self,
        args: Vec<Value>,
        buffer: impl FnOnce(&CallBuffer, Vec<Value>) -> R,
    ) -> Route<E, R> {
        let _gate = self.inner.gate();
        match self.inner.ready.get() {
            Some((engine, _)) => Route::Direct(Arc::clone(engine), args),
            None => Route::Buffered(buffer(&self.inner.buffer, args)),
        }
    }

    // -------------------------------------------------------------------------
    // Readiness
    // -------------------------------------------------------------------------

    /// A fresh chain over the loader's result.
    ///
    /// Fulfills once the engine is ready and calls go straight to it.
    pub fn loaded(&self) -> Chain<Loaded<E, C>> {
        Chain::new(self.inner.settled.clone())
    }

    /// Continue with the engine and context once loaded.
    pub fn then<U, F>(&self, f: F) -> Chain<U>
    where
        U: Send + 'static,
        F: FnOnce(Loaded<E, C>) -> U + Send + 'static,
    {
        self.loaded().then(f)
    }

    /// Observe a load failure.
    ///
    /// Resolves to `None` once `h` has handled the rejection, or to the
    /// loaded pair if loading succeeded.
    pub fn catch<F>(&self, h: F) -> Chain<Option<Loaded<E, C>>>
    where
        F: FnOnce(LoadError) + Send + 'static,
    {
        self.loaded().then(Some).catch(move |reason| {
            h(reason);
            None
        })
    }

    /// Run `f` once loading settles, whatever the outcome.
    pub fn finally<F>(&self, f: F) -> Chain<Loaded<E, C>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.loaded().finally(f)
    }

    /// Wait until the engine loaded and every buffered call reached it.
    ///
    /// Results of scheduled calls may still be pending.
    pub async fn wait_flushed(&self) -> Result<(), LoadError> {
        self.loaded().await.map(drop)
    }

    /// Whether the engine has loaded and calls now go to it directly.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.get().is_some()
    }

    /// The engine, once loaded.
    pub fn engine(&self) -> Option<Arc<E>> {
        self.inner.ready.get().map(|(engine, _)| Arc::clone(engine))
    }

    /// The context, once loaded.
    pub fn context(&self) -> Option<Arc<C>> {
        self.inner.ready.get().map(|(_, context)| Arc::clone(context))
    }

    /// The buffer shared with the loader.
    pub fn buffer(&self) -> &Arc<CallBuffer> {
        &self.inner.buffer
    }
}

macro_rules! proxy_methods {
    (
        deferred { $($deferred:ident => $dop:ident),* $(,)? }
        chainable { $($chainable:ident => $cop:ident),* $(,)? }
    ) => {
        impl<E: Engine, C: Send + Sync + 'static> Facade<E, C> {
            $(
                #[doc = concat!("Deferred `", stringify!($dop), "`. See [`Facade::call`].")]
                pub fn $deferred(&self, args: Vec<Value>) -> PendingCall {
                    self.call(Operation::$dop, args)
                }
            )*
            $(
                #[doc = concat!("Chainable `", stringify!($cop), "`. See [`Facade::call_chainable`].")]
                pub fn $chainable(&self, args: Vec<Value>) -> &Self {
                    self.call_chainable(Operation::$cop, args)
                }
            )*
        }
    };
}

proxy_methods! {
    deferred {
        track_submit => TrackSubmit,
        track_click => TrackClick,
        track_link => TrackLink,
        track_form => TrackForm,
        pageview => PageView,
        identify => Identify,
        reset => Reset,
        group => Group,
        track => Track,
        ready => Ready,
        alias => Alias,
        page => Page,
        add_source_middleware => AddSourceMiddleware,
        add_integration_middleware => AddIntegrationMiddleware,
        set_anonymous_id => SetAnonymousId,
        add_destination_middleware => AddDestinationMiddleware,
    }
    chainable {
        debug => Debug,
        once => Once,
        off => Off,
        on => On,
    }
}

impl<'a, E: Engine, C: Send + Sync + 'static> IntoFuture for &'a Facade<E, C> {
    type Output = Result<Loaded<E, C>, LoadError>;
    type IntoFuture = Chain<Loaded<E, C>>;

    fn into_future(self) -> Self::IntoFuture {
        self.loaded()
    }
}

impl<E, C> fmt::Debug for Facade<E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Facade")
            .field("ready", &self.inner.ready.get().is_some())
            .field("buffer", &self.inner.buffer)
            .finish_non_exhaustive()
    }
}

/// Await the loader, flush until nothing new arrives, then cache the result.
async fn drive<E, C>(
    inner: Weak<Inner<E, C>>,
    load: SharedLoad<E, C>,
    plan: FlushPlan,
    scheduler: Arc<dyn Scheduler>,
) where
    E: Engine,
    C: Send + Sync + 'static,
{
    let loaded = match load.await {
        Ok(loaded) => loaded,
        Err(err) => {
            debug!(error = %err, "engine failed to load");
            return;
        }
    };

    let Some(inner) = inner.upgrade() else {
        trace!("façade dropped before the engine loaded");
        return;
    };

    debug!(buffered = inner.buffer.pending(), "engine loaded, flushing");
    let engine = Arc::clone(&loaded.0);
    let mut passes = 0;
    loop {
        let seen = inner.buffer.len();
        let started = plan.run(&engine, &inner.buffer, scheduler.as_ref()).await;
        started.await;
        passes += 1;

        let quiet = {
            let _gate = inner.gate();
            let quiet = inner.buffer.len() == seen;
            if quiet {
                let _ = inner.ready.set(loaded.clone());
                inner.published.send_replace(true);
            }
            quiet
        };
        if quiet {
            break;
        }
        trace!(passes, "calls arrived while flushing, flushing again");
    }
    info!(passes, remaining = inner.buffer.pending(), "engine ready");
}
