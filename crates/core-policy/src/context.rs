//! Call-scoped execution metadata
//!
//! A [`Context`] travels with one execution through every policy layer. It
//! carries two reserved keys plus an arbitrary key/value bag:
//!
//! - **operation key**: identifies the caller's logical operation, set per call
//! - **policy key**: identifies the policy currently executing, stamped by each layer
//!
//! Cloning a context shares its bag, so values added by an inner layer (or by
//! the operation itself) are visible to outer layers and to the caller once
//! the call returns.
//!
//! # Example
//!
//! ```
//! use bulwark_core_policy::Context;
//!
//! let ctx = Context::with_operation_key("GetCustomer").with_data("CustomerId", "12345");
//!
//! assert_eq!(ctx.operation_key(), Some("GetCustomer"));
//! assert_eq!(ctx.get("CustomerId"), Some(serde_json::json!("12345")));
//! ```

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Execution metadata shared by all layers of one call
#[derive(Debug, Clone)]
pub struct Context {
    operation_key: Option<Arc<str>>,
    policy_key: Option<Arc<str>>,
    policy_wrap_key: Option<Arc<str>>,
    correlation_id: Uuid,
    data: Arc<RwLock<HashMap<String, Value>>>,
}

impl Context {
    /// Create an empty context with a fresh correlation id
    pub fn new() -> Self {
        Self {
            operation_key: None,
            policy_key: None,
            policy_wrap_key: None,
            correlation_id: Uuid::new_v4(),
            data: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a context for the named logical operation
    pub fn with_operation_key(operation_key: impl Into<String>) -> Self {
        let mut ctx = Self::new();
        ctx.operation_key = Some(Arc::from(operation_key.into()));
        ctx
    }

    /// Builder-style insert of a bag value
    pub fn with_data(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn operation_key(&self) -> Option<&str> {
        self.operation_key.as_deref()
    }

    /// Key of the innermost policy that has stamped this context
    pub fn policy_key(&self) -> Option<&str> {
        self.policy_key.as_deref()
    }

    /// Key of the policy wrap executing this call, if any
    pub fn policy_wrap_key(&self) -> Option<&str> {
        self.policy_wrap_key.as_deref()
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Read a bag value
    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    /// Add or replace a bag value, returning the previous one
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.data.write().insert(key.into(), value.into())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Copy of the bag at this instant
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.data.read().clone()
    }

    /// Derived context stamped with the executing policy's key
    pub(crate) fn for_policy(&self, policy_key: &str) -> Self {
        let mut ctx = self.clone();
        ctx.policy_key = Some(Arc::from(policy_key));
        ctx
    }

    pub(crate) fn for_wrap(&self, wrap_key: &str) -> Self {
        let mut ctx = self.for_policy(wrap_key);
        ctx.policy_wrap_key = Some(Arc::from(wrap_key));
        ctx
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a policy key of the form `Kind-1a2b3c4d`
pub(crate) fn generated_policy_key(kind: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", kind, &id[..8])
}
