//! # Preinit
//!
//! Accept calls to an engine that is still loading, and run each of them
//! exactly once when it becomes ready.
//!
//! ## Core Concepts
//!
//! - [`Operation`] = a named engine action, tagged with a [`CallKind`]
//! - [`CallRecord`] = one buffered invocation and how to settle it
//! - [`Facade`] = the stand-in callers talk to while the engine loads
//!
//! The key principle: **every accepted call runs exactly once**. Before
//! readiness it is buffered; after readiness it goes straight to the engine.
//! A record's `called` flag is claimed atomically, so overlapping flushes
//! cannot run it twice.
//!
//! ## Architecture
//!
//! ```text
//! bootstrap stub ──snippet──► normalize_snippet ──┐
//!                                                 │ seed
//!                                                 ▼
//! caller ──track()/on()──► Facade ──────────► CallBuffer
//!                             │                   │
//!                             │ ready             │ FlushPlan::run
//!                             ▼                   ▼
//!                           Engine ◄──── sequential / replay / scheduled
//! ```
//!
//! ## Guarantees
//!
//! - **Exactly once**: a record reaches the engine at most once, and every
//!   record buffered before readiness reaches it
//! - **No overtaking**: the façade turns ready only after every buffered
//!   call has reached the engine
//! - **FIFO per operation**: calls to one operation run in issue order
//! - **No cross-operation order**: strategies decide per operation
//! - **Failure isolation**: a failing call settles its own result only
//! - **In-memory only**: buffered calls die with the process
//!
//! ## Example
//!
//! ```ignore
//! use preinit::{Engine, Facade, Invocation, Operation};
//! use serde_json::json;
//!
//! let facade = Facade::new(|buffer| {
//!     Ok(async move {
//!         let engine = Arc::new(Analytics::connect().await?);
//!         Ok((engine, Settings::default()))
//!     }
//!     .boxed())
//! })?;
//!
//! // Buffered: the engine is not there yet.
//! let tracked = facade.track(vec![json!("signup"), json!({"plan": "pro"})]);
//! facade.on(vec![json!("ready")]).debug(vec![json!(true)]);
//!
//! // Settles once the engine loaded and the flush ran it.
//! let ctx = tracked.await?;
//!
//! // Readiness itself is awaitable.
//! let (engine, settings) = (&facade).await?;
//! ```
//!
//! ## What This Is Not
//!
//! Preinit is **not**:
//! - A durable queue
//! - A retry layer
//! - The engine itself

// Core modules
mod buffer;
mod chain;
mod config;
mod engine;
mod error;
mod facade;
mod flush;
mod invoke;
mod operation;
mod record;
mod snippet;

// Inspector host for event activity traces
pub mod inspector;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export operation table
pub use operation::{CallKind, Operation};

// Re-export error types
pub use error::{LoadError, PreInitError};

// Re-export call records and buffer
pub use buffer::CallBuffer;
pub use record::{CallRecord, OnFailure, OnSuccess};

// Re-export engine boundary
pub use engine::{Engine, Invocation};

// Re-export invoker
pub use invoke::{invoke, invoke_sync};

// Re-export flush strategies
pub use flush::{
    flush_in_new_task, flush_replay, flush_scheduled, flush_sequential, FlushPlan, FlushStep,
    Scheduler, Started, TokioScheduler,
};

// Re-export façade types (primary entry point)
pub use chain::Chain;
pub use facade::{Dispatched, Facade, FacadeBuilder, LoadFuture, Loaded, PendingCall};

// Re-export snippet import
pub use snippet::{import_snippet, normalize_snippet, parse_snippet, read_snippet, SnippetSource};

// Re-export configuration
pub use config::{FlushMode, PreInitConfig, DEFAULT_INSPECTOR_DOCKING, DEFAULT_SNIPPET_VAR};
