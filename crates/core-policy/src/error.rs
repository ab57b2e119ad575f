//! Fault taxonomy and construction errors
//!
//! Every execution produces an [`Outcome`](crate::Outcome), which is either the
//! operation's value or a [`Fault`]. Faults form a closed enumeration so that
//! policies can classify them with ordinary pattern matching.

use std::time::Duration;
use thiserror::Error;

/// Coarse classification of where a fault came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOrigin {
    /// The protected operation itself failed
    OriginError,
    /// A policy refused or abandoned the execution (circuit, timeout, bulkhead)
    PolicyRejected,
    /// The operation explicitly asked for a fallback
    ManualFallback,
    /// The caller's cancellation signal fired while a policy was waiting
    Cancelled,
}

/// A classified execution failure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Fault<E> {
    /// The operation returned an error
    #[error("operation failed: {0}")]
    Origin(E),

    /// Rejected by an open circuit, or by a half-open circuit whose trial is in flight
    #[error("circuit is open, execution rejected")]
    BrokenCircuit,

    /// Rejected by a manually isolated circuit
    #[error("circuit is isolated, execution rejected")]
    IsolatedCircuit,

    /// Execution exceeded its time budget
    #[error("execution timed out after {after:?}")]
    Timeout { after: Duration },

    /// No execution slot and the wait queue is full
    #[error("bulkhead capacity exhausted, execution rejected")]
    BulkheadRejected,

    /// The operation requested substitution by an enclosing fallback
    #[error("manual fallback requested: {0}")]
    ManualFallback(String),

    /// Caller cancellation observed while suspended inside a policy
    #[error("execution cancelled by caller")]
    Cancelled,
}

impl<E> Fault<E> {
    /// Classify this fault by origin
    pub fn origin(&self) -> FaultOrigin {
        match self {
            Fault::Origin(_) => FaultOrigin::OriginError,
            Fault::BrokenCircuit
            | Fault::IsolatedCircuit
            | Fault::Timeout { .. }
            | Fault::BulkheadRejected => FaultOrigin::PolicyRejected,
            Fault::ManualFallback(_) => FaultOrigin::ManualFallback,
            Fault::Cancelled => FaultOrigin::Cancelled,
        }
    }

    /// True if the operation itself produced this fault
    pub fn is_origin(&self) -> bool {
        matches!(self, Fault::Origin(_))
    }

    /// True if a policy rejected the execution
    pub fn is_rejection(&self) -> bool {
        self.origin() == FaultOrigin::PolicyRejected
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Fault::Timeout { .. })
    }

    pub fn is_broken_circuit(&self) -> bool {
        matches!(self, Fault::BrokenCircuit | Fault::IsolatedCircuit)
    }

    /// Borrow the operation's own error, if this is an origin fault
    pub fn origin_error(&self) -> Option<&E> {
        match self {
            Fault::Origin(e) => Some(e),
            _ => None,
        }
    }

    /// Take the operation's own error, if this is an origin fault
    pub fn into_origin(self) -> Option<E> {
        match self {
            Fault::Origin(e) => Some(e),
            _ => None,
        }
    }

    /// Map the wrapped operation error, leaving policy faults untouched
    pub fn map_origin<F, E2>(self, f: F) -> Fault<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            Fault::Origin(e) => Fault::Origin(f(e)),
            Fault::BrokenCircuit => Fault::BrokenCircuit,
            Fault::IsolatedCircuit => Fault::IsolatedCircuit,
            Fault::Timeout { after } => Fault::Timeout { after },
            Fault::BulkheadRejected => Fault::BulkheadRejected,
            Fault::ManualFallback(reason) => Fault::ManualFallback(reason),
            Fault::Cancelled => Fault::Cancelled,
        }
    }
}

/// Invalid policy construction parameters
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("failure rate threshold must be within (0, 1], got {0}")]
    FailureRate(f64),

    #[error("exponential backoff factor must be finite and at least 1, got {0}")]
    BackoffFactor(f64),

    #[error(
        "bulkhead capacity {max_concurrency} + {max_queue} exceeds the limit of {limit} slots"
    )]
    Capacity {
        max_concurrency: usize,
        max_queue: usize,
        limit: usize,
    },

    #[error("fallback policy requires a fallback value or producer")]
    MissingFallback,

    #[error("policy wrap requires at least one policy")]
    EmptyWrap,
}

/// Policy registry lookup and registration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a policy is already registered under key '{0}'")]
    DuplicateKey(String),

    #[error("no policy registered under key '{0}'")]
    NotFound(String),

    #[error("policy '{key}' is registered for a different result or error type")]
    TypeMismatch { key: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_classification() {
        let origin: Fault<String> = Fault::Origin("boom".to_string());
        assert_eq!(origin.origin(), FaultOrigin::OriginError);
        assert!(origin.is_origin());
        assert!(!origin.is_rejection());

        let circuit: Fault<String> = Fault::BrokenCircuit;
        assert_eq!(circuit.origin(), FaultOrigin::PolicyRejected);
        assert!(circuit.is_broken_circuit());

        let timeout: Fault<String> = Fault::Timeout {
            after: Duration::from_secs(1),
        };
        assert!(timeout.is_timeout());
        assert!(timeout.is_rejection());

        let manual: Fault<String> = Fault::ManualFallback("degraded".into());
        assert_eq!(manual.origin(), FaultOrigin::ManualFallback);

        assert_eq!(Fault::<String>::Cancelled.origin(), FaultOrigin::Cancelled);
    }

    #[test]
    fn test_map_origin_keeps_policy_faults() {
        let fault: Fault<&str> = Fault::Origin("io");
        assert_eq!(fault.map_origin(str::len), Fault::Origin(2));

        let rejected: Fault<&str> = Fault::BulkheadRejected;
        assert_eq!(rejected.map_origin(str::len), Fault::BulkheadRejected);
    }

    #[test]
    fn test_display() {
        let fault: Fault<String> = Fault::Origin("db down".to_string());
        assert_eq!(fault.to_string(), "operation failed: db down");
        assert_eq!(
            RegistryError::NotFound("orders".into()).to_string(),
            "no policy registered under key 'orders'"
        );
    }
}
