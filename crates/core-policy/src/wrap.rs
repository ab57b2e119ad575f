//! Ordered composition of policies
//!
//! A [`PolicyWrap`] holds policies outermost first. Executing it runs the
//! first policy with a continuation that runs the second, and so on, with
//! the real operation innermost:
//!
//! ```text
//! PolicyWrap [Fallback, Retry, CircuitBreaker, Timeout]
//!
//!   Fallback ─▶ Retry ─▶ CircuitBreaker ─▶ Timeout ─▶ operation
//!      ◀─────────── outcomes propagate outward ◀──────────┘
//! ```
//!
//! A fault raised by an inner layer is an ordinary outcome to the layers
//! outside it, so an outer Fallback can substitute a `BrokenCircuit` raised by
//! an inner breaker. The wrap is itself a [`Policy`] and can be nested or
//! registered.

use crate::context::{generated_policy_key, Context};
use crate::error::ConfigError;
use crate::outcome::Outcome;
use crate::policy::{Operation, Policy};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type Chain<T, E> = Arc<[Arc<dyn Policy<T, E>>]>;

/// A fixed, ordered chain of policies acting as one
pub struct PolicyWrap<T, E> {
    key: String,
    chain: Chain<T, E>,
}

impl<T, E> PolicyWrap<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn builder() -> PolicyWrapBuilder<T, E> {
        PolicyWrapBuilder {
            key: None,
            policies: Vec::new(),
        }
    }

    /// Keys of the wrapped policies, outermost first
    pub fn policy_keys(&self) -> Vec<&str> {
        self.chain.iter().map(|p| p.policy_key()).collect()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

impl<T, E> Clone for PolicyWrap<T, E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            chain: Arc::clone(&self.chain),
        }
    }
}

impl<T, E> fmt::Debug for PolicyWrap<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyWrap")
            .field("key", &self.key)
            .field("policies", &self.policy_keys())
            .finish()
    }
}

/// Continuation that runs `chain[index..]` around `innermost`
fn link<T, E>(chain: Chain<T, E>, index: usize, innermost: Operation<T, E>) -> Operation<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    if index >= chain.len() {
        return innermost;
    }
    Operation::with_outcome(move |ctx, cancel| {
        let policy = Arc::clone(&chain[index]);
        let next = link(Arc::clone(&chain), index + 1, innermost.clone());
        async move { policy.execute_operation(next, ctx, cancel).await }
    })
}

#[async_trait]
impl<T, E> Policy<T, E> for PolicyWrap<T, E>
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
        let ctx = context.for_wrap(&self.key);
        let next = link(Arc::clone(&self.chain), 1, operation);
        self.chain[0].execute_operation(next, ctx, cancel).await
    }
}

/// Builder for [`PolicyWrap`]; policies are added outermost first
pub struct PolicyWrapBuilder<T, E> {
    key: Option<String>,
    policies: Vec<Arc<dyn Policy<T, E>>>,
}

impl<T, E> PolicyWrapBuilder<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn policy_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add the next policy inward
    pub fn wrap<P>(self, policy: P) -> Self
    where
        P: Policy<T, E> + 'static,
    {
        self.wrap_shared(Arc::new(policy))
    }

    /// Add a shared policy, e.g. a breaker also used elsewhere
    pub fn wrap_shared(mut self, policy: Arc<dyn Policy<T, E>>) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn build(self) -> Result<PolicyWrap<T, E>, ConfigError> {
        if self.policies.is_empty() {
            return Err(ConfigError::EmptyWrap);
        }
        Ok(PolicyWrap {
            key: self.key.unwrap_or_else(|| generated_policy_key("PolicyWrap")),
            chain: Arc::from(self.policies),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreaker;
    use crate::error::Fault;
    use crate::fallback::FallbackPolicy;
    use crate::policy::{NoOpPolicy, PolicyExt};
    use crate::retry::RetryPolicy;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Records when it is entered and what its context looked like
    struct Probe {
        key: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Policy<u32, String> for Probe {
        fn policy_key(&self) -> &str {
            &self.key
        }

        async fn execute_operation(
            &self,
            operation: Operation<u32, String>,
            context: Context,
            cancel: CancellationToken,
        ) -> Outcome<u32, String> {
            self.log.lock().push(format!(
                "{} wrap={}",
                self.key,
                context.policy_wrap_key().unwrap_or("-")
            ));
            context.insert(self.key.clone(), true);
            operation.invoke(context, cancel).await
        }
    }

    fn probe(key: &str, log: &Arc<Mutex<Vec<String>>>) -> Probe {
        Probe {
            key: key.to_string(),
            log: Arc::clone(log),
        }
    }

    #[test]
    fn test_empty_wrap_rejected() {
        let built = PolicyWrap::<u32, String>::builder().build();
        assert!(matches!(built, Err(ConfigError::EmptyWrap)));
    }

    #[tokio::test]
    async fn test_outermost_first_and_context_accumulates() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let wrap = PolicyWrap::builder()
            .policy_key("OrdersPipeline")
            .wrap(probe("outer", &log))
            .wrap(probe("middle", &log))
            .wrap(probe("inner", &log))
            .build()
            .unwrap();

        assert_eq!(wrap.policy_keys(), vec!["outer", "middle", "inner"]);

        let ctx = Context::with_operation_key("GetOrders");
        let outcome = wrap
            .execute_with_context(ctx.clone(), |ctx| async move {
                Ok(ctx.len() as u32)
            })
            .await;

        assert_eq!(outcome, Ok(3));
        assert_eq!(
            *log.lock(),
            vec![
                "outer wrap=OrdersPipeline",
                "middle wrap=OrdersPipeline",
                "inner wrap=OrdersPipeline",
            ]
        );
        assert!(ctx.contains_key("outer") && ctx.contains_key("inner"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_substitutes_inner_broken_circuit() {
        let breaker = CircuitBreaker::basic(1, Duration::from_secs(60)).unwrap();
        let wrap = PolicyWrap::builder()
            .wrap(
                FallbackPolicy::<String, String>::builder()
                    .fallback_value("substitute".to_string())
                    .build()
                    .unwrap(),
            )
            .wrap(breaker.clone())
            .build()
            .unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let op = {
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<String, _>("backend down".to_string()) }
            }
        };

        assert_eq!(wrap.execute(op.clone()).await, Ok("substitute".to_string()));
        assert_eq!(wrap.execute(op).await, Ok("substitute".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "second call rejected by breaker");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_outside_breaker_sees_broken_circuit() {
        let calls = Arc::new(AtomicU32::new(0));
        let wrap = PolicyWrap::builder()
            .wrap(RetryPolicy::<u32, String>::retry(3))
            .wrap(CircuitBreaker::basic(2, Duration::from_secs(60)).unwrap())
            .build()
            .unwrap();

        let counter = Arc::clone(&calls);
        let outcome = wrap
            .execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err("down".to_string()) }
            })
            .await;

        assert_eq!(outcome, Err(Fault::BrokenCircuit));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_nested_wraps() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = PolicyWrap::builder()
            .policy_key("inner-wrap")
            .wrap(probe("b", &log))
            .build()
            .unwrap();
        let outer = PolicyWrap::builder()
            .policy_key("outer-wrap")
            .wrap(probe("a", &log))
            .wrap(inner)
            .wrap(NoOpPolicy::with_key("noop"))
            .build()
            .unwrap();

        let outcome = outer.execute(|| async { Ok(1) }).await;
        assert_eq!(outcome, Ok(1));
        assert_eq!(*log.lock(), vec!["a wrap=outer-wrap", "b wrap=inner-wrap"]);
    }
}
