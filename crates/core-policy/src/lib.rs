//! Bulwark Core Policy: Pure-logic resilience policies
//!
//! # Overview
//!
//! This crate wraps an arbitrary fallible operation with composable
//! fault-handling behaviours. It includes:
//!
//! - **Retry**: Re-invokes on classified faults with an optional delay (backoff, jitter)
//! - **Circuit Breaker**: Fails fast while the operation is unhealthy (consecutive or rate based)
//! - **Timeout**: Bounds execution time, optimistically (cancel) or pessimistically (abandon)
//! - **Fallback**: Substitutes a default outcome for classified faults
//! - **Bulkhead**: Bounds concurrent executions with a bounded FIFO wait queue
//! - **Cache**: Memoizes successful outcomes by key with a TTL
//! - **PolicyWrap**: Composes an ordered chain of policies into one
//! - **PolicyRegistry**: Named lookup for pre-built policies
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Transports (HTTP, databases, message queues)
//! - Telemetry sinks (policies expose hooks and emit `tracing` events only)
//! - Process wiring or dependency injection
//!
//! Every policy implements the same [`Policy`] contract, so wrapping one
//! around another never requires knowing what is inside.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │ execute(op, context, cancel)
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Fallback                          │  ← Substitute on failure
//! └─────────────┬───────────────────────────┘
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Retry                             │  ← Re-invoke with backoff
//! └─────────────┬───────────────────────────┘
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail fast when unhealthy
//! └─────────────┬───────────────────────────┘
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Timeout                           │  ← Bound each attempt
//! └─────────────┬───────────────────────────┘
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Bulkhead                          │  ← Bound concurrency
//! └─────────────┬───────────────────────────┘
//!               ▼
//!         Protected operation
//!
//!  Outcome<T, E> = Result<T, Fault<E>> propagates back outward;
//!  each layer may retry, substitute or pass it on.
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use bulwark_core_policy::prelude::*;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ConfigError> {
//! let pipeline = PolicyWrap::<String, String>::builder()
//!     .policy_key("CatalogPipeline")
//!     .wrap(
//!         FallbackPolicy::builder()
//!             .fallback_value("[]".to_string())
//!             .build()?,
//!     )
//!     .wrap(RetryPolicy::wait_and_retry(3, Backoff::Constant { delay_ms: 200 }))
//!     .wrap(CircuitBreaker::basic(5, Duration::from_secs(30))?)
//!     .wrap(TimeoutPolicy::optimistic(Duration::from_secs(2))?)
//!     .build()?;
//!
//! let ctx = Context::with_operation_key("ListProducts");
//! let products = pipeline
//!     .execute_with_context(ctx, |_ctx| async { Ok("[\"widget\"]".to_string()) })
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod bulkhead;
pub mod cache;
pub mod circuit_breaker;
pub mod context;
pub mod error;
pub mod fallback;
pub mod outcome;
pub mod policy;
pub mod registry;
pub mod retry;
pub mod timeout;
pub mod wrap;

// Re-export main types for convenience
pub use bulkhead::{BulkheadPolicy, BulkheadPolicyBuilder};
pub use cache::{CachePolicy, CachePolicyBuilder, CacheProvider, MemoryCacheProvider};
pub use circuit_breaker::{
    BreakRecord, BreakerStrategy, CircuitBreaker, CircuitBreakerBuilder, CircuitBreakerConfig,
    CircuitState,
};
pub use context::Context;
pub use error::{ConfigError, Fault, FaultOrigin, RegistryError};
pub use fallback::{FallbackPolicy, FallbackPolicyBuilder};
pub use outcome::{Classifier, Outcome, OutcomeType, PolicyResult};
pub use policy::{NoOpPolicy, Operation, Policy, PolicyExt};
pub use registry::PolicyRegistry;
pub use retry::{Backoff, DelaySelector, Jitter, RetryPolicy, RetryPolicyBuilder};
pub use timeout::{TimeoutPolicy, TimeoutPolicyBuilder, TimeoutStrategy};
pub use wrap::{PolicyWrap, PolicyWrapBuilder};

/// Re-exported so callers can build cancellable operations without a direct dependency
pub use tokio_util::sync::CancellationToken;

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use bulwark_core_policy::prelude::*;
/// ```
pub mod prelude {
    pub use super::bulkhead::BulkheadPolicy;
    pub use super::cache::{CachePolicy, CacheProvider, MemoryCacheProvider};
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::context::Context;
    pub use super::error::{ConfigError, Fault, FaultOrigin, RegistryError};
    pub use super::fallback::FallbackPolicy;
    pub use super::outcome::{Classifier, Outcome, PolicyResult};
    pub use super::policy::{Operation, Policy, PolicyExt};
    pub use super::registry::PolicyRegistry;
    pub use super::retry::{Backoff, Jitter, RetryPolicy};
    pub use super::timeout::{TimeoutPolicy, TimeoutStrategy};
    pub use super::wrap::PolicyWrap;
    pub use tokio_util::sync::CancellationToken;
}
