//! The composable policy contract
//!
//! A [`Policy`] executes an [`Operation`] with a [`Context`] and a
//! cancellation token, and returns an [`Outcome`]. Policies never need to know
//! what they wrap: the next layer inward is just another operation.

use crate::context::Context;
use crate::error::Fault;
use crate::outcome::{Outcome, PolicyResult};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type Invoke<T, E> =
    dyn Fn(Context, CancellationToken) -> BoxFuture<'static, Outcome<T, E>> + Send + Sync;

/// A re-invocable unit of work.
///
/// Retry invokes the same operation several times, so anything single-use
/// (a consumed request body, a one-shot channel) must be created inside the
/// closure rather than captured by it.
pub struct Operation<T, E> {
    invoke: Arc<Invoke<T, E>>,
}

impl<T, E> Operation<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Wrap an async, cancellable operation returning `Result<T, E>`
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Context, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::with_outcome(move |ctx, cancel| {
            let fut = f(ctx, cancel);
            async move { fut.await.map_err(Fault::Origin) }
        })
    }

    /// Wrap an operation that produces an [`Outcome`] directly, e.g. one that
    /// returns [`Fault::ManualFallback`]
    pub fn with_outcome<F, Fut>(f: F) -> Self
    where
        F: Fn(Context, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<T, E>> + Send + 'static,
    {
        Self {
            invoke: Arc::new(move |ctx: Context, cancel: CancellationToken| {
                f(ctx, cancel).boxed()
            }),
        }
    }

    /// Wrap a synchronous operation. It runs on the blocking thread pool and
    /// cannot observe cancellation; once started it runs to completion even
    /// if every caller has gone away.
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(Context) -> Result<T, E> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::with_outcome(move |ctx, _cancel| {
            let f = Arc::clone(&f);
            async move {
                match tokio::task::spawn_blocking(move || f(ctx)).await {
                    Ok(result) => result.map_err(Fault::Origin),
                    Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                    Err(_) => Err(Fault::Cancelled),
                }
            }
        })
    }

    /// Start one invocation
    pub fn invoke(
        &self,
        ctx: Context,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Outcome<T, E>> {
        (self.invoke)(ctx, cancel)
    }
}

impl<T, E> Clone for Operation<T, E> {
    fn clone(&self) -> Self {
        Self {
            invoke: Arc::clone(&self.invoke),
        }
    }
}

impl<T, E> fmt::Debug for Operation<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation").finish_non_exhaustive()
    }
}

/// A composable fault-handling behaviour
#[async_trait]
pub trait Policy<T, E>: Send + Sync
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Key identifying this policy instance in hooks, logs and contexts
    fn policy_key(&self) -> &str;

    /// Execute `operation` under this policy
    async fn execute_operation(
        &self,
        operation: Operation<T, E>,
        context: Context,
        cancel: CancellationToken,
    ) -> Outcome<T, E>;
}

#[async_trait]
impl<T, E, P> Policy<T, E> for Arc<P>
where
    T: Send + 'static,
    E: Send + 'static,
    P: Policy<T, E> + ?Sized,
{
    fn policy_key(&self) -> &str {
        (**self).policy_key()
    }

    async fn execute_operation(
        &self,
        operation: Operation<T, E>,
        context: Context,
        cancel: CancellationToken,
    ) -> Outcome<T, E> {
        (**self).execute_operation(operation, context, cancel).await
    }
}

/// Closure-friendly entry points available on every policy
#[async_trait]
pub trait PolicyExt<T, E>: Policy<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Execute with a fresh context and no external cancellation
    async fn execute<F, Fut>(&self, f: F) -> Outcome<T, E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.execute_with_context(Context::new(), move |_| f()).await
    }

    /// Execute with a caller-supplied context
    async fn execute_with_context<F, Fut>(&self, context: Context, f: F) -> Outcome<T, E>
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let operation = Operation::new(move |ctx, _cancel| f(ctx));
        self.execute_operation(operation, context, CancellationToken::new())
            .await
    }

    /// Execute with a context and a cancellation token that reaches the operation
    async fn execute_cancellable<F, Fut>(
        &self,
        context: Context,
        cancel: CancellationToken,
        f: F,
    ) -> Outcome<T, E>
    where
        F: Fn(Context, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.execute_operation(Operation::new(f), context, cancel)
            .await
    }

    /// Execute and capture the outcome together with the final context
    async fn execute_and_capture<F, Fut>(&self, context: Context, f: F) -> PolicyResult<T, E>
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let outcome = self.execute_with_context(context.clone(), f).await;
        PolicyResult::new(outcome, context)
    }
}

impl<T, E, P> PolicyExt<T, E> for P
where
    T: Send + 'static,
    E: Send + 'static,
    P: Policy<T, E> + ?Sized,
{
}

/// Pass-through policy, useful as a registry placeholder or in tests
#[derive(Debug, Clone)]
pub struct NoOpPolicy {
    key: String,
}

impl NoOpPolicy {
    pub fn new() -> Self {
        Self {
            key: crate::context::generated_policy_key("NoOp"),
        }
    }

    pub fn with_key(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Default for NoOpPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T, E> Policy<T, E> for NoOpPolicy
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn policy_key(&self) -> &str {
        &self.key
    }

    async fn execute_operation(
        &self,
        operation: Operation<T, E>,
        context: Context,
        cancel: CancellationToken,
    ) -> Outcome<T, E> {
        operation.invoke(context.for_policy(&self.key), cancel).await
    }
}
