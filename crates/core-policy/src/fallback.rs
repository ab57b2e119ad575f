//! Fallback substituting a default outcome for handled faults
//!
//! The operation is invoked exactly once. If its outcome is handled by the
//! classifier it is discarded and replaced by whatever the fallback producer
//! returns; otherwise it passes through untouched. Put a Retry inside the
//! Fallback to get both behaviours.

use crate::context::{generated_policy_key, Context};
use crate::error::ConfigError;
use crate::outcome::{Classifier, Outcome};
use crate::policy::{Operation, Policy};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Producer<T, E> = Arc<
    dyn Fn(Outcome<T, E>, Context, CancellationToken) -> BoxFuture<'static, Outcome<T, E>>
        + Send
        + Sync,
>;

type FallbackHook<T, E> = Arc<dyn Fn(&Outcome<T, E>, &Context) + Send + Sync>;

/// Replaces handled outcomes with a substitute
pub struct FallbackPolicy<T, E> {
    key: String,
    classifier: Classifier<T, E>,
    producer: Producer<T, E>,
    on_fallback: Option<FallbackHook<T, E>>,
}

impl<T, E> FallbackPolicy<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn builder() -> FallbackPolicyBuilder<T, E> {
        FallbackPolicyBuilder {
            key: None,
            classifier: Classifier::all_faults(),
            producer: None,
            on_fallback: None,
        }
    }

    /// Fallback returning a clone of `value` for every fault
    pub fn value(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self {
            key: generated_policy_key("Fallback"),
            classifier: Classifier::all_faults(),
            producer: value_producer(value),
            on_fallback: None,
        }
    }
}

fn value_producer<T, E>(value: T) -> Producer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + 'static,
{
    Arc::new(move |_: Outcome<T, E>, _: Context, _: CancellationToken| {
        futures::future::ready(Ok(value.clone())).boxed()
    })
}

impl<T, E> fmt::Debug for FallbackPolicy<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackPolicy")
            .field("key", &self.key)
            .field("classifier", &self.classifier)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T, E> Policy<T, E> for FallbackPolicy<T, E>
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
        let ctx = context.for_policy(&self.key);
        let outcome = operation.invoke(ctx.clone(), cancel.clone()).await;

        if !self.classifier.handles(&outcome) {
            return outcome;
        }

        debug!(
            policy_key = %self.key,
            operation_key = ctx.operation_key().unwrap_or_default(),
            correlation_id = %ctx.correlation_id(),
            "substituting fallback outcome"
        );
        if let Some(hook) = &self.on_fallback {
            hook(&outcome, &ctx);
        }
        (self.producer)(outcome, ctx, cancel).await
    }
}

/// Builder for [`FallbackPolicy`]
pub struct FallbackPolicyBuilder<T, E> {
    key: Option<String>,
    classifier: Classifier<T, E>,
    producer: Option<Producer<T, E>>,
    on_fallback: Option<FallbackHook<T, E>>,
}

impl<T, E> FallbackPolicyBuilder<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn policy_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Which outcomes are replaced (default: every fault)
    pub fn handle(mut self, classifier: Classifier<T, E>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Substitute a clone of `value`
    pub fn fallback_value(mut self, value: T) -> Self
    where
        T: Clone + Sync,
    {
        self.producer = Some(value_producer(value));
        self
    }

    /// Substitute the outcome of `f`, which receives the discarded outcome
    pub fn fallback_with<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Outcome<T, E>, Context, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<T, E>> + Send + 'static,
    {
        self.producer = Some(Arc::new(
            move |outcome: Outcome<T, E>, ctx: Context, cancel: CancellationToken| {
                f(outcome, ctx, cancel).boxed()
            },
        ));
        self
    }

    /// Called with the discarded outcome before the substitute is produced
    pub fn on_fallback<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Outcome<T, E>, &Context) + Send + Sync + 'static,
    {
        self.on_fallback = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<FallbackPolicy<T, E>, ConfigError> {
        let producer = self.producer.ok_or(ConfigError::MissingFallback)?;
        Ok(FallbackPolicy {
            key: self.key.unwrap_or_else(|| generated_policy_key("Fallback")),
            classifier: self.classifier,
            producer,
            on_fallback: self.on_fallback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Fault;
    use crate::policy::PolicyExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_missing_producer() {
        let built = FallbackPolicy::<String, String>::builder().build();
        assert_eq!(built.err(), Some(ConfigError::MissingFallback));
    }

    #[tokio::test]
    async fn test_substitutes_handled_fault_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let policy = FallbackPolicy::<String, String>::value("cached".to_string());

        let outcome = policy
            .execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err("upstream down".to_string()) }
            })
            .await;

        assert_eq!(outcome, Ok("cached".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let policy = FallbackPolicy::<String, String>::value("cached".to_string());
        let outcome = policy.execute(|| async { Ok("live".to_string()) }).await;
        assert_eq!(outcome, Ok("live".to_string()));
    }

    #[tokio::test]
    async fn test_unhandled_fault_passes_through() {
        let policy = FallbackPolicy::<String, String>::builder()
            .handle(Classifier::handle(|f: &Fault<String>| f.is_broken_circuit()))
            .fallback_value("degraded".to_string())
            .build()
            .unwrap();

        let outcome = policy
            .execute(|| async { Err::<String, _>("bad input".to_string()) })
            .await;
        assert_eq!(outcome, Err(Fault::Origin("bad input".to_string())));
    }

    #[tokio::test]
    async fn test_handles_unacceptable_result() {
        let policy = FallbackPolicy::<u16, String>::builder()
            .handle(Classifier::handle_result(|status: &u16| *status >= 500))
            .fallback_with(|outcome, _, _| async move {
                assert_eq!(outcome, Ok(502));
                Ok(204)
            })
            .build()
            .unwrap();

        assert_eq!(policy.execute(|| async { Ok(502) }).await, Ok(204));
        assert_eq!(policy.execute(|| async { Ok(200) }).await, Ok(200));
    }

    #[tokio::test]
    async fn test_manual_fallback_request() {
        let policy = FallbackPolicy::<String, String>::builder()
            .handle(Classifier::handle(|f: &Fault<String>| {
                matches!(f, Fault::ManualFallback(_))
            }))
            .fallback_with(|outcome, _, _| async move {
                match outcome {
                    Err(Fault::ManualFallback(reason)) => Ok(format!("fallback: {reason}")),
                    other => other,
                }
            })
            .build()
            .unwrap();

        let outcome = policy
            .execute_operation(
                Operation::with_outcome(|_, _| async {
                    Err(Fault::ManualFallback("maintenance".to_string()))
                }),
                Context::new(),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome, Ok("fallback: maintenance".to_string()));
    }

    #[tokio::test]
    async fn test_on_fallback_sees_discarded_outcome() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let policy = FallbackPolicy::<String, String>::builder()
            .policy_key("CatalogFallback")
            .fallback_value("[]".to_string())
            .on_fallback(move |outcome, ctx| {
                sink.lock().push((
                    outcome.clone(),
                    ctx.policy_key().unwrap_or_default().to_string(),
                ));
            })
            .build()
            .unwrap();

        let _ = policy
            .execute(|| async { Err::<String, _>("timeout".to_string()) })
            .await;

        assert_eq!(
            *seen.lock(),
            vec![(
                Err(Fault::Origin("timeout".to_string())),
                "CatalogFallback".to_string()
            )]
        );
    }
}
