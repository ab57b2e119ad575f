//! Timeout bounding execution duration
//!
//! Two strategies:
//!
//! - **Optimistic**: the operation receives a child cancellation token that is
//!   cancelled when the timeout elapses. The policy returns [`Fault::Timeout`]
//!   immediately and hands the in-flight future to a detached task, so the
//!   operation is signalled but never forcibly stopped. It is expected to
//!   watch the token and finish promptly; one that ignores it keeps running
//!   like a pessimistic timeout would, with its result discarded.
//! - **Pessimistic**: the operation runs on its own spawned task and is raced
//!   against a timer. When the timer wins the task is **detached, not
//!   cancelled**: it keeps running until it finishes on its own and its result
//!   is discarded. Use this for operations that cannot observe cancellation,
//!   and bound their resource usage independently (for example with their own
//!   deadline), since every timed-out call can leave one orphaned task behind.

use crate::context::{generated_policy_key, Context};
use crate::error::{ConfigError, Fault};
use crate::outcome::Outcome;
use crate::policy::{Operation, Policy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// How a timed-out operation is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutStrategy {
    /// Signal cancellation and stop waiting
    #[default]
    Optimistic,
    /// Stop waiting and leave the operation running detached
    Pessimistic,
}

impl fmt::Display for TimeoutStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutStrategy::Optimistic => write!(f, "optimistic"),
            TimeoutStrategy::Pessimistic => write!(f, "pessimistic"),
        }
    }
}

type TimeoutHook = Arc<dyn Fn(&Context, Duration, TimeoutStrategy) + Send + Sync>;

/// Bounds how long an execution may take
///
/// The same timeout policy can guard operations of any result type.
#[derive(Clone)]
pub struct TimeoutPolicy {
    key: String,
    timeout: Duration,
    strategy: TimeoutStrategy,
    on_timeout: Option<TimeoutHook>,
}

impl TimeoutPolicy {
    pub fn optimistic(timeout: Duration) -> Result<Self, ConfigError> {
        Self::builder(timeout).build()
    }

    pub fn pessimistic(timeout: Duration) -> Result<Self, ConfigError> {
        Self::builder(timeout)
            .strategy(TimeoutStrategy::Pessimistic)
            .build()
    }

    pub fn builder(timeout: Duration) -> TimeoutPolicyBuilder {
        TimeoutPolicyBuilder {
            key: None,
            timeout,
            strategy: TimeoutStrategy::Optimistic,
            on_timeout: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn strategy(&self) -> TimeoutStrategy {
        self.strategy
    }

    fn timed_out<T, E>(&self, ctx: &Context) -> Outcome<T, E> {
        warn!(
            policy_key = %self.key,
            operation_key = ctx.operation_key().unwrap_or_default(),
            correlation_id = %ctx.correlation_id(),
            timeout_ms = self.timeout.as_millis() as u64,
            strategy = %self.strategy,
            "execution timed out"
        );
        if let Some(hook) = &self.on_timeout {
            hook(ctx, self.timeout, self.strategy);
        }
        Err(Fault::Timeout {
            after: self.timeout,
        })
    }

    async fn run_optimistic<T, E>(
        &self,
        operation: Operation<T, E>,
        ctx: Context,
        cancel: CancellationToken,
    ) -> Outcome<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let child = cancel.child_token();
        let mut running = operation.invoke(ctx.clone(), child.clone());

        tokio::select! {
            biased;
            outcome = &mut running => outcome,
            _ = tokio::time::sleep(self.timeout) => {
                child.cancel();
                // Detached, not dropped, so the operation still sees the signal
                tokio::spawn(running);
                self.timed_out(&ctx)
            }
        }
    }

    async fn run_pessimistic<T, E>(
        &self,
        operation: Operation<T, E>,
        ctx: Context,
        cancel: CancellationToken,
    ) -> Outcome<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let mut task = tokio::spawn(operation.invoke(ctx.clone(), cancel.clone()));

        tokio::select! {
            biased;
            joined = &mut task => match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => Err(Fault::Cancelled),
            },
            _ = cancel.cancelled() => Err(Fault::Cancelled),
            _ = tokio::time::sleep(self.timeout) => {
                // Dropping the handle detaches the task; it is never aborted
                drop(task);
                trace!(policy_key = %self.key, "abandoned operation left running");
                self.timed_out(&ctx)
            }
        }
    }
}

impl fmt::Debug for TimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutPolicy")
            .field("key", &self.key)
            .field("timeout", &self.timeout)
            .field("strategy", &self.strategy)
            .finish()
    }
}

#[async_trait]
impl<T, E> Policy<T, E> for TimeoutPolicy
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
        match self.strategy {
            TimeoutStrategy::Optimistic => self.run_optimistic(operation, ctx, cancel).await,
            TimeoutStrategy::Pessimistic => self.run_pessimistic(operation, ctx, cancel).await,
        }
    }
}

/// Builder for [`TimeoutPolicy`]
pub struct TimeoutPolicyBuilder {
    key: Option<String>,
    timeout: Duration,
    strategy: TimeoutStrategy,
    on_timeout: Option<TimeoutHook>,
}

impl TimeoutPolicyBuilder {
    pub fn policy_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn strategy(mut self, strategy: TimeoutStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Called with the context, the configured timeout and the strategy
    pub fn on_timeout<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Context, Duration, TimeoutStrategy) + Send + Sync + 'static,
    {
        self.on_timeout = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<TimeoutPolicy, ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::Zero { field: "timeout" });
        }
        Ok(TimeoutPolicy {
            key: self.key.unwrap_or_else(|| generated_policy_key("Timeout")),
            timeout: self.timeout,
            strategy: self.strategy,
            on_timeout: self.on_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyExt;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_zero_timeout_rejected() {
        assert_eq!(
            TimeoutPolicy::optimistic(Duration::ZERO).err(),
            Some(ConfigError::Zero { field: "timeout" })
        );
    }

    #[test]
    fn test_strategy_serde() {
        let strategy: TimeoutStrategy = serde_json::from_str("\"pessimistic\"").unwrap();
        assert_eq!(strategy, TimeoutStrategy::Pessimistic);
        assert_eq!(TimeoutStrategy::default(), TimeoutStrategy::Optimistic);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_operation_passes_through() {
        let policy = TimeoutPolicy::optimistic(Duration::from_secs(1)).unwrap();
        let outcome: Outcome<u32, String> = policy
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(7)
            })
            .await;
        assert_eq!(outcome, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_signals_cancellation() {
        let observed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&observed);
        let policy = TimeoutPolicy::optimistic(Duration::from_secs(1)).unwrap();

        let start = Instant::now();
        let outcome: Outcome<(), String> = policy
            .execute_cancellable(Context::new(), CancellationToken::new(), move |_, token| {
                let flag = Arc::clone(&flag);
                let watched = token.clone();
                // Work handed off to another task observes the token
                tokio::spawn(async move {
                    watched.cancelled().await;
                    flag.store(true, Ordering::SeqCst);
                });
                async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                }
            })
            .await;

        assert_eq!(
            outcome,
            Err(Fault::Timeout {
                after: Duration::from_secs(1)
            })
        );
        assert_eq!(start.elapsed(), Duration::from_secs(1));

        tokio::task::yield_now().await;
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_lets_operation_clean_up() {
        let cleaned_up = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cleaned_up);
        let policy = TimeoutPolicy::optimistic(Duration::from_millis(200)).unwrap();

        let outcome: Outcome<(), String> = policy
            .execute_cancellable(Context::new(), CancellationToken::new(), move |_, token| {
                let flag = Arc::clone(&flag);
                async move {
                    tokio::select! {
                        _ = token.cancelled() => {
                            // Runs after the caller already has its timeout
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            flag.store(true, Ordering::SeqCst);
                            Err("aborted".to_string())
                        }
                        _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(()),
                    }
                }
            })
            .await;

        assert!(outcome.is_err_and(|fault| fault.is_timeout()));
        assert!(!cleaned_up.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cleaned_up.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pessimistic_abandons_operation() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let policy = TimeoutPolicy::pessimistic(Duration::from_secs(1)).unwrap();

        let start = Instant::now();
        let outcome: Outcome<(), String> = policy
            .execute(move || {
                let flag = Arc::clone(&flag);
                async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(outcome.as_ref().is_err_and(Fault::is_timeout));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert!(!finished.load(Ordering::SeqCst));

        // The detached operation still runs to completion
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pessimistic_observes_caller_cancellation() {
        let policy = TimeoutPolicy::pessimistic(Duration::from_secs(10)).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let outcome: Outcome<(), String> = policy
            .execute_cancellable(Context::new(), cancel, |_, _| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        assert_eq!(outcome, Err(Fault::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_timeout_hook() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let policy = TimeoutPolicy::builder(Duration::from_millis(500))
            .policy_key("SlowCallTimeout")
            .strategy(TimeoutStrategy::Pessimistic)
            .on_timeout(move |ctx, timeout, strategy| {
                *sink.lock() = Some((ctx.policy_key().map(str::to_string), timeout, strategy));
            })
            .build()
            .unwrap();

        let _: Outcome<(), String> = policy
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert_eq!(
            seen.lock().clone(),
            Some((
                Some("SlowCallTimeout".to_string()),
                Duration::from_millis(500),
                TimeoutStrategy::Pessimistic
            ))
        );
    }
}
