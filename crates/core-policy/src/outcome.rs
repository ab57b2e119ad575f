//! Execution outcomes and fault classification
//!
//! [`Outcome`] is the envelope every policy returns. [`Classifier`] decides
//! which outcomes a policy handles: Retry retries them, Fallback substitutes
//! them, and the circuit breaker counts them as failures.

use crate::context::Context;
use crate::error::{Fault, FaultOrigin};
use std::fmt;
use std::sync::Arc;

/// Result of one execution: the operation's value or a classified fault
pub type Outcome<T, E> = Result<T, Fault<E>>;

/// Whether an execution ended in success or failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeType {
    Successful,
    Failure,
}

/// Captured execution: outcome plus the context it ran with
#[derive(Debug)]
pub struct PolicyResult<T, E> {
    outcome: Outcome<T, E>,
    context: Context,
}

impl<T, E> PolicyResult<T, E> {
    pub(crate) fn new(outcome: Outcome<T, E>, context: Context) -> Self {
        Self { outcome, context }
    }

    pub fn outcome_type(&self) -> OutcomeType {
        match self.outcome {
            Ok(_) => OutcomeType::Successful,
            Err(_) => OutcomeType::Failure,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The value, if the execution succeeded
    pub fn result(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    /// The fault that ended the execution, if it failed
    pub fn final_fault(&self) -> Option<&Fault<E>> {
        self.outcome.as_ref().err()
    }

    pub fn fault_origin(&self) -> Option<FaultOrigin> {
        self.final_fault().map(Fault::origin)
    }

    /// Context after execution, including values added by any layer
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn into_result(self) -> Outcome<T, E> {
        self.outcome
    }
}

type FaultPredicate<E> = Arc<dyn Fn(&Fault<E>) -> bool + Send + Sync>;
type ResultPredicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Predicate over outcomes deciding which ones a policy handles.
///
/// Fault predicates match `Err` outcomes; result predicates match `Ok` values
/// that represent an error condition (e.g. a response with a 5xx status).
///
/// # Example
///
/// ```
/// use bulwark_core_policy::{Classifier, Fault};
///
/// let classifier = Classifier::<u16, String>::origin_errors()
///     .or_fault(|f| f.is_timeout())
///     .or_result(|status| *status >= 500);
///
/// assert!(classifier.handles(&Ok(503)));
/// assert!(!classifier.handles(&Ok(200)));
/// assert!(classifier.handles(&Err(Fault::Origin("reset".into()))));
/// assert!(!classifier.handles(&Err(Fault::BulkheadRejected)));
/// ```
pub struct Classifier<T, E> {
    faults: Vec<FaultPredicate<E>>,
    results: Vec<ResultPredicate<T>>,
}

impl<T, E> Classifier<T, E>
where
    T: 'static,
    E: 'static,
{
    /// Handles nothing
    pub fn none() -> Self {
        Self {
            faults: Vec::new(),
            results: Vec::new(),
        }
    }

    /// Handles every fault, never a successful value
    pub fn all_faults() -> Self {
        Self::none().or_fault(|_| true)
    }

    /// Handles only faults produced by the operation itself
    pub fn origin_errors() -> Self {
        Self::none().or_fault(Fault::is_origin)
    }

    /// Handles faults matching the predicate
    pub fn handle<F>(predicate: F) -> Self
    where
        F: Fn(&Fault<E>) -> bool + Send + Sync + 'static,
    {
        Self::none().or_fault(predicate)
    }

    /// Handles successful values matching the predicate
    pub fn handle_result<F>(predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self::none().or_result(predicate)
    }

    pub fn or_fault<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Fault<E>) -> bool + Send + Sync + 'static,
    {
        self.faults.push(Arc::new(predicate));
        self
    }

    /// Also handle origin faults whose error matches the predicate
    pub fn or_origin<F>(self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.or_fault(move |fault| fault.origin_error().is_some_and(&predicate))
    }

    pub fn or_result<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.results.push(Arc::new(predicate));
        self
    }

    /// True if any predicate matches the outcome
    pub fn handles(&self, outcome: &Outcome<T, E>) -> bool {
        match outcome {
            Ok(value) => self.results.iter().any(|p| p(value)),
            Err(fault) => self.faults.iter().any(|p| p(fault)),
        }
    }
}

impl<T, E> Default for Classifier<T, E>
where
    T: 'static,
    E: 'static,
{
    fn default() -> Self {
        Self::all_faults()
    }
}

impl<T, E> Clone for Classifier<T, E> {
    fn clone(&self) -> Self {
        Self {
            faults: self.faults.clone(),
            results: self.results.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Classifier<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("fault_predicates", &self.faults.len())
            .field("result_predicates", &self.results.len())
            .finish()
    }
}
