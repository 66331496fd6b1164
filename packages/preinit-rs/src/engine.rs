//! The boundary to the real engine.
//!
//! The engine decides *how* an operation runs. This crate only decides
//! *when* and *how many times*, so the engine is seen through a single
//! positional-call method.

use std::future::Future;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::operation::Operation;

/// What an engine operation returned.
pub enum Invocation {
    /// A plain value, available immediately.
    Value(Value),
    /// An asynchronous result.
    Pending(BoxFuture<'static, Result<Value>>),
}

impl Invocation {
    /// Wrap a plain return value.
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    /// Wrap an asynchronous return value.
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::Pending(future.boxed())
    }

    /// Wait for the value, whichever shape it came in.
    pub async fn resolve(self) -> Result<Value> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Pending(future) => future.await,
        }
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

/// An engine that can run every deferrable operation.
///
/// `Err` models a synchronous failure; an `Invocation::Pending` that resolves
/// to `Err` models an asynchronous one. Both reach the caller the same way.
///
/// # Example
///
/// ```ignore
/// struct Analytics { queue: EventQueue }
///
/// impl Engine for Analytics {
///     fn invoke(&self, operation: Operation, args: Vec<Value>) -> Result<Invocation> {
///         match operation {
///             Operation::Track => {
///                 let queue = self.queue.clone();
///                 Ok(Invocation::pending(async move { queue.dispatch("track", args).await }))
///             }
///             Operation::On => {
///                 self.emitter.register(args)?;
///                 Ok(Invocation::value(Value::Null))
///             }
///             other => Err(anyhow!("{other} is not supported")),
///         }
///     }
/// }
/// ```
pub trait Engine: Send + Sync + 'static {
    /// Run `operation` with positional `args`.
    fn invoke(&self, operation: Operation, args: Vec<Value>) -> Result<Invocation>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_plain_value() {
        let value = Invocation::value("x").resolve().await.unwrap();
        assert_eq!(value, Value::from("x"));
    }

    #[tokio::test]
    async fn test_resolve_pending_value() {
        let invocation = Invocation::pending(async { Ok(Value::from(7)) });
        assert_eq!(invocation.resolve().await.unwrap(), Value::from(7));
    }

    #[tokio::test]
    async fn test_resolve_pending_failure() {
        let invocation = Invocation::pending(async { Err(anyhow::anyhow!("rejected")) });
        let err = invocation.resolve().await.unwrap_err();
        assert_eq!(err.to_string(), "rejected");
    }

    #[test]
    fn test_debug_hides_future() {
        let invocation = Invocation::pending(async { Ok(Value::Null) });
        assert_eq!(format!("{:?}", invocation), "Pending(..)");
    }
}
