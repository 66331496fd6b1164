//! Promise-like continuations over the engine's readiness.
//!
//! A [`Chain`] is a thin wrapper around one boxed future of
//! `Result<T, LoadError>`. Every method delegates to a `futures` combinator,
//! so the usual semantics come for free:
//!
//! - `then` / `and_then` run only on fulfillment; a rejection skips them
//! - `catch` / `or_else` run only on rejection; a recovered chain is
//!   fulfilled again for every later link
//! - `finally` runs on either outcome and passes the outcome through
//!
//! ```ignore
//! let label = facade
//!     .then(|(engine, _ctx)| engine.name())
//!     .catch(|err| format!("offline: {err}"))
//!     .finally(|| tracing::debug!("readiness observed"))
//!     .await?;
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{self, BoxFuture};
use futures::{FutureExt, TryFutureExt};

use crate::error::LoadError;

/// An awaitable link in a continuation chain.
#[must_use = "a chain does nothing unless awaited"]
pub struct Chain<T> {
    inner: BoxFuture<'static, Result<T, LoadError>>,
}

impl<T: Send + 'static> Chain<T> {
    pub(crate) fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, LoadError>> + Send + 'static,
    {
        Self {
            inner: future.boxed(),
        }
    }

    /// A chain that is already fulfilled.
    pub fn fulfilled(value: T) -> Self {
        Self::new(future::ok(value))
    }

    /// A chain that is already rejected.
    pub fn rejected(reason: LoadError) -> Self {
        Self::new(future::err(reason))
    }

    /// Map the fulfilled value.
    pub fn then<U, F>(self, f: F) -> Chain<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        Chain::new(self.inner.map_ok(f))
    }

    /// Continue with an asynchronous step that may itself fail.
    pub fn and_then<U, F, Fut>(self, f: F) -> Chain<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        Chain::new(
            self.inner
                .and_then(move |value| f(value).map_err(LoadError::from)),
        )
    }

    /// Recover from a rejection. Later links observe the recovered value.
    pub fn catch<F>(self, f: F) -> Chain<T>
    where
        F: FnOnce(LoadError) -> T + Send + 'static,
    {
        Chain::new(self.inner.or_else(move |reason| future::ok(f(reason))))
    }

    /// Recover asynchronously, or reject again.
    pub fn or_else<F, Fut>(self, f: F) -> Chain<T>
    where
        F: FnOnce(LoadError) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Chain::new(
            self.inner
                .or_else(move |reason| f(reason).map_err(LoadError::from)),
        )
    }

    /// Run `f` once the chain settles, whatever the outcome.
    pub fn finally<F>(self, f: F) -> Chain<T>
    where
        F: FnOnce() + Send + 'static,
    {
        Chain::new(self.inner.inspect(move |_| f()))
    }
}

impl<T> Future for Chain<T> {
    type Output = Result<T, LoadError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl<T> fmt::Debug for Chain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain").finish_non_exhaustive()
    }
}
