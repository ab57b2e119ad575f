//! Retry with optional delay between attempts
//!
//! The operation is invoked, and while its outcome is handled by the
//! classifier and fewer than `max_retries` retries have happened, the policy
//! waits for the selected delay and invokes it again. Total invocations never
//! exceed `max_retries + 1`. When retries run out the last outcome is returned
//! unchanged, so callers only learn about the retries through the hook.
//!
//! # Example
//!
//! ```no_run
//! use bulwark_core_policy::{Backoff, Jitter, PolicyExt, RetryPolicy};
//! use std::time::Duration;
//!
//! # async fn example() {
//! // 0.5s, 1s, 2s plus up to 500ms of jitter
//! let retry = RetryPolicy::<String, std::io::Error>::builder()
//!     .max_retries(3)
//!     .backoff_with_jitter(
//!         Backoff::Exponential { base_ms: 500, factor: 2.0, max_ms: None },
//!         Jitter::up_to(Duration::from_millis(500)),
//!     )
//!     .on_retry(|_outcome, attempt, delay, _ctx| println!("retry {attempt} in {delay:?}"))
//!     .build();
//!
//! let body = retry.execute(|| async { Ok("payload".to_string()) }).await;
//! # }
//! ```

use crate::context::{generated_policy_key, Context};
use crate::error::{ConfigError, Fault};
use crate::outcome::{Classifier, Outcome};
use crate::policy::{Operation, Policy};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Ready-made delay curves, indexed by 1-based retry attempt
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately
    None,
    /// Same delay before every retry
    Constant { delay_ms: u64 },
    /// `step_ms * attempt`
    Linear { step_ms: u64 },
    /// `base_ms * factor^(attempt - 1)`, capped at `max_ms`
    Exponential {
        base_ms: u64,
        factor: f64,
        #[serde(default)]
        max_ms: Option<u64>,
    },
}

impl Backoff {
    /// Delay before the given retry (1 = first retry)
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Constant { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Linear { step_ms } => {
                Duration::from_millis(step_ms.saturating_mul(u64::from(attempt)))
            }
            Backoff::Exponential {
                base_ms,
                factor,
                max_ms,
            } => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let millis = base_ms as f64 * factor.powi(exponent);
                let capped = match max_ms {
                    Some(max) => millis.min(max as f64),
                    None => millis,
                };
                if capped.is_nan() || capped < 0.0 {
                    return Duration::from_millis(max_ms.unwrap_or(0));
                }
                // Saturates once the curve outgrows Duration
                Duration::try_from_secs_f64(capped / 1000.0).unwrap_or(Duration::MAX)
            }
        }
    }

    /// Reject exponential factors that are not finite or shrink the delay
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Backoff::Exponential { factor, .. } if !factor.is_finite() || factor < 1.0 => {
                Err(ConfigError::BackoffFactor(factor))
            }
            _ => Ok(()),
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::None
    }
}

/// Random extra delay drawn uniformly from `[0, max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Jitter {
    pub max_ms: u64,
}

impl Jitter {
    pub fn none() -> Self {
        Self { max_ms: 0 }
    }

    pub fn up_to(max: Duration) -> Self {
        Self {
            max_ms: u64::try_from(max.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Add jitter to a base delay
    pub fn apply(&self, delay: Duration) -> Duration {
        if self.max_ms == 0 {
            return delay;
        }
        let extra = rand::rng().random_range(0..self.max_ms);
        delay.saturating_add(Duration::from_millis(extra))
    }
}

/// Chooses the wait before retry `attempt` given the outcome that triggered it
pub type DelaySelector<T, E> = Arc<dyn Fn(u32, &Outcome<T, E>, &Context) -> Duration + Send + Sync>;

type RetryHook<T, E> = Arc<dyn Fn(&Outcome<T, E>, u32, Duration, &Context) + Send + Sync>;

/// Re-invokes the operation on handled outcomes
pub struct RetryPolicy<T, E> {
    key: String,
    classifier: Classifier<T, E>,
    max_retries: u32,
    delay: Option<DelaySelector<T, E>>,
    on_retry: Option<RetryHook<T, E>>,
}

impl<T, E> RetryPolicy<T, E>
where
    T: 'static,
    E: 'static,
{
    pub fn builder() -> RetryPolicyBuilder<T, E> {
        RetryPolicyBuilder::new()
    }

    /// Retry every fault up to `max_retries` times without waiting
    pub fn retry(max_retries: u32) -> Self {
        Self::builder().retry(max_retries).build()
    }

    /// Retry every fault up to `max_retries` times with a fixed-curve delay
    pub fn wait_and_retry(max_retries: u32, backoff: Backoff) -> Self {
        Self::builder()
            .max_retries(max_retries)
            .backoff(backoff)
            .build()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl<T, E> fmt::Debug for RetryPolicy<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("key", &self.key)
            .field("max_retries", &self.max_retries)
            .field("classifier", &self.classifier)
            .field("delay", &self.delay.as_ref().map(|_| "<selector>"))
            .finish()
    }
}

#[async_trait]
impl<T, E> Policy<T, E> for RetryPolicy<T, E>
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
        let mut retries = 0u32;

        loop {
            let outcome = operation.invoke(ctx.clone(), cancel.clone()).await;

            if retries >= self.max_retries || !self.classifier.handles(&outcome) {
                if retries > 0 && outcome.is_err() {
                    debug!(
                        policy_key = %self.key,
                        correlation_id = %ctx.correlation_id(),
                        retries,
                        "retries exhausted"
                    );
                }
                return outcome;
            }

            retries += 1;
            let delay = self
                .delay
                .as_ref()
                .map_or(Duration::ZERO, |select| select(retries, &outcome, &ctx));

            debug!(
                policy_key = %self.key,
                operation_key = ctx.operation_key().unwrap_or_default(),
                correlation_id = %ctx.correlation_id(),
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                "retrying operation"
            );
            if let Some(hook) = &self.on_retry {
                hook(&outcome, retries, delay, &ctx);
            }
            drop(outcome);

            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Fault::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            } else if cancel.is_cancelled() {
                return Err(Fault::Cancelled);
            }
        }
    }
}

/// Builder for [`RetryPolicy`]
pub struct RetryPolicyBuilder<T, E> {
    key: Option<String>,
    classifier: Classifier<T, E>,
    max_retries: u32,
    delay: Option<DelaySelector<T, E>>,
    on_retry: Option<RetryHook<T, E>>,
}

impl<T, E> RetryPolicyBuilder<T, E>
where
    T: 'static,
    E: 'static,
{
    fn new() -> Self {
        Self {
            key: None,
            classifier: Classifier::all_faults(),
            max_retries: 1,
            delay: None,
            on_retry: None,
        }
    }

    pub fn policy_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Which outcomes are retried (default: every fault)
    pub fn handle(mut self, classifier: Classifier<T, E>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Retry up to `max_retries` times without waiting
    pub fn retry(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self.delay = None;
        self
    }

    /// Retry up to `max_retries` times, waiting `delay(attempt)` before each
    pub fn wait_and_retry<F>(self, max_retries: u32, delay: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.max_retries(max_retries).delay_fn(delay)
    }

    pub fn backoff(self, backoff: Backoff) -> Self {
        self.backoff_with_jitter(backoff, Jitter::none())
    }

    pub fn backoff_with_jitter(self, backoff: Backoff, jitter: Jitter) -> Self {
        self.delay_fn(move |attempt| jitter.apply(backoff.delay(attempt)))
    }

    /// Delay as a function of the 1-based retry attempt
    pub fn delay_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.delay = Some(Arc::new(
            move |attempt: u32, _: &Outcome<T, E>, _: &Context| f(attempt),
        ));
        self
    }

    /// Delay chosen from the attempt, the triggering outcome and the context
    pub fn delay_selector<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, &Outcome<T, E>, &Context) -> Duration + Send + Sync + 'static,
    {
        self.delay = Some(Arc::new(f));
        self
    }

    /// Called before each retry with the outcome, attempt number and delay
    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Outcome<T, E>, u32, Duration, &Context) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> RetryPolicy<T, E> {
        RetryPolicy {
            key: self.key.unwrap_or_else(|| generated_policy_key("Retry")),
            classifier: self.classifier,
            max_retries: self.max_retries,
            delay: self.delay,
            on_retry: self.on_retry,
        }
    }
}
