//! Bulkhead isolation bounding concurrent executions
//!
//! At most `max_concurrency` executions run at once and at most `max_queue`
//! more wait for a slot. Waiters are admitted strictly FIFO. A call arriving
//! when both are full is rejected with [`Fault::BulkheadRejected`] without
//! running the operation.
//!
//! Two semaphores enforce this: an admission semaphore sized
//! `max_concurrency + max_queue` taken without waiting, and a fair execution
//! semaphore sized `max_concurrency` that queued callers wait on.

use crate::context::{generated_policy_key, Context};
use crate::error::{ConfigError, Fault};
use crate::outcome::Outcome;
use crate::policy::{Operation, Policy};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

type RejectedHook = Arc<dyn Fn(&Context) + Send + Sync>;

/// Concurrency-bounding admission gate with a bounded wait queue
///
/// Clones share slots, so a single bulkhead can be handed to many tasks.
#[derive(Clone)]
pub struct BulkheadPolicy {
    key: Arc<str>,
    max_concurrency: usize,
    max_queue: usize,
    execution: Arc<Semaphore>,
    admission: Arc<Semaphore>,
    on_rejected: Option<RejectedHook>,
}

impl BulkheadPolicy {
    pub fn new(max_concurrency: usize, max_queue: usize) -> Result<Self, ConfigError> {
        Self::builder(max_concurrency, max_queue).build()
    }

    pub fn builder(max_concurrency: usize, max_queue: usize) -> BulkheadPolicyBuilder {
        BulkheadPolicyBuilder {
            key: None,
            max_concurrency,
            max_queue,
            on_rejected: None,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn max_queue(&self) -> usize {
        self.max_queue
    }

    /// Execution slots currently free
    pub fn available_execution_slots(&self) -> usize {
        self.execution.available_permits()
    }

    /// Wait-queue places currently free
    pub fn available_queue_slots(&self) -> usize {
        self.admission.available_permits().min(self.max_queue)
    }
}

impl fmt::Debug for BulkheadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadPolicy")
            .field("key", &self.key)
            .field("max_concurrency", &self.max_concurrency)
            .field("max_queue", &self.max_queue)
            .field("available_execution_slots", &self.available_execution_slots())
            .field("available_queue_slots", &self.available_queue_slots())
            .finish()
    }
}

#[async_trait]
impl<T, E> Policy<T, E> for BulkheadPolicy
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

        let _admitted = match self.admission.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    policy_key = %self.key,
                    operation_key = ctx.operation_key().unwrap_or_default(),
                    correlation_id = %ctx.correlation_id(),
                    max_concurrency = self.max_concurrency,
                    max_queue = self.max_queue,
                    "bulkhead full, execution rejected"
                );
                if let Some(hook) = &self.on_rejected {
                    hook(&ctx);
                }
                return Err(Fault::BulkheadRejected);
            }
        };

        let _executing = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Fault::Cancelled),
            permit = self.execution.acquire() => match permit {
                Ok(permit) => permit,
                // Semaphores are never closed
                Err(_) => return Err(Fault::BulkheadRejected),
            },
        };
        trace!(policy_key = %self.key, "bulkhead slot acquired");

        operation.invoke(ctx, cancel).await
    }
}

/// Builder for [`BulkheadPolicy`]
pub struct BulkheadPolicyBuilder {
    key: Option<String>,
    max_concurrency: usize,
    max_queue: usize,
    on_rejected: Option<RejectedHook>,
}

impl BulkheadPolicyBuilder {
    pub fn policy_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Called with the rejected call's context
    pub fn on_rejected<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        self.on_rejected = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<BulkheadPolicy, ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Zero {
                field: "max_concurrency",
            });
        }
        let capacity = self
            .max_concurrency
            .checked_add(self.max_queue)
            .filter(|total| *total <= Semaphore::MAX_PERMITS)
            .ok_or(ConfigError::Capacity {
                max_concurrency: self.max_concurrency,
                max_queue: self.max_queue,
                limit: Semaphore::MAX_PERMITS,
            })?;
        let key = self.key.unwrap_or_else(|| generated_policy_key("Bulkhead"));
        Ok(BulkheadPolicy {
            key: Arc::from(key),
            max_concurrency: self.max_concurrency,
            max_queue: self.max_queue,
            execution: Arc::new(Semaphore::new(self.max_concurrency)),
            admission: Arc::new(Semaphore::new(capacity)),
            on_rejected: self.on_rejected,
        })
    }
}
