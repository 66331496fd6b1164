//! Error types for the pre-initialization layer.
//!
//! Two kinds of failure cross this crate's boundary:
//!
//! - [`PreInitError`]: pattern-matchable errors raised by the crate itself
//!   (unknown operation names, bad flush plans, abandoned calls, config).
//! - [`LoadError`]: the engine loader's rejection. It is cloneable because
//!   every continuation chained onto a façade observes the same rejection.
//!
//! Engine failures travel as `anyhow::Error` and are never rewrapped: a call
//! that failed inside the engine surfaces the engine's own error, whether it
//! ran directly or was buffered first.
//!
//! # Example
//!
//! ```ignore
//! use preinit::PreInitError;
//!
//! match facade.track(vec![json!("signup")]).await {
//!     Ok(value) => println!("tracked: {value}"),
//!     Err(e) => match e.downcast_ref::<PreInitError>() {
//!         Some(PreInitError::Abandoned { operation }) => {
//!             eprintln!("{operation} was dropped before the engine loaded");
//!         }
//!         _ => eprintln!("engine rejected the call: {e}"),
//!     },
//! }
//! ```

use std::sync::Arc;

use thiserror::Error;

use crate::operation::Operation;

/// Structured errors raised by the pre-initialization layer itself.
#[derive(Debug, Clone, Error)]
pub enum PreInitError {
    /// A snippet entry or config named an operation outside the table.
    #[error("unknown operation {name:?}")]
    UnknownOperation {
        /// The name as it was written.
        name: String,
    },

    /// The façade was constructed outside a Tokio runtime, so nothing could
    /// drive the loader to readiness.
    #[error("no Tokio runtime available to drive engine readiness")]
    NoRuntime,

    /// A buffered call was dropped before any flush settled it, e.g. because
    /// the buffer was cleared.
    #[error("{operation} call was dropped before the engine ran it")]
    Abandoned {
        /// The operation that never ran.
        operation: Operation,
    },

    /// The engine panicked while running an operation.
    #[error("engine panicked while running {operation}: {message}")]
    EnginePanicked {
        /// The operation that was running.
        operation: Operation,
        /// The panic payload, if it was a string.
        message: String,
    },

    /// A flush plan designated the same operation to two steps.
    #[error("{operation} is already drained by another flush step")]
    DuplicateFlushStep {
        /// The operation designated twice.
        operation: Operation,
    },

    /// A flush plan already ends in a scheduled step.
    #[error("flush plan already has a scheduled step")]
    DuplicateScheduledStep,

    /// A configuration variable held a value that could not be used.
    #[error("invalid value for {var}: {reason}")]
    InvalidConfig {
        /// The environment variable name.
        var: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// The engine loader's rejection, shared by every chained continuation.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct LoadError(Arc<anyhow::Error>);

impl LoadError {
    /// The loader's original error.
    pub fn reason(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for LoadError {
    fn from(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
