//! Named lookup for pre-built policies
//!
//! The registry is populated once at startup through `&mut self` and then
//! shared (typically behind an `Arc`) for concurrent lookups, which need no
//! locking. Policies for different result and error types can live in the
//! same registry; a lookup with the wrong types fails with
//! [`RegistryError::TypeMismatch`].
//!
//! # Example
//!
//! ```
//! use bulwark_core_policy::{PolicyRegistry, RetryPolicy, TimeoutPolicy};
//! use std::time::Duration;
//!
//! let mut registry = PolicyRegistry::new();
//! registry
//!     .add::<String, String, _>("SimpleRetry", RetryPolicy::retry(3))
//!     .unwrap();
//! registry
//!     .add::<String, String, _>("ShortTimeout", TimeoutPolicy::optimistic(Duration::from_secs(1)).unwrap())
//!     .unwrap();
//!
//! assert!(registry.get::<String, String>("SimpleRetry").is_ok());
//! assert!(registry.get::<u32, String>("SimpleRetry").is_err());
//! ```

use crate::error::RegistryError;
use crate::policy::Policy;
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

struct Entry {
    /// Always an `Arc<dyn Policy<T, E>>`
    policy: Box<dyn Any + Send + Sync>,
    signature: &'static str,
}

/// Mapping from string key to a built policy
#[derive(Default)]
pub struct PolicyRegistry {
    entries: HashMap<String, Entry>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `policy` under `key`; fails if the key is taken
    pub fn add<T, E, P>(&mut self, key: impl Into<String>, policy: P) -> Result<(), RegistryError>
    where
        T: Send + 'static,
        E: Send + 'static,
        P: Policy<T, E> + 'static,
    {
        self.add_shared(key, Arc::new(policy) as Arc<dyn Policy<T, E>>)
    }

    /// Register an already shared policy
    pub fn add_shared<T, E>(
        &mut self,
        key: impl Into<String>,
        policy: Arc<dyn Policy<T, E>>,
    ) -> Result<(), RegistryError>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let key = key.into();
        if self.entries.contains_key(&key) {
            return Err(RegistryError::DuplicateKey(key));
        }
        self.entries.insert(
            key,
            Entry {
                policy: Box::new(policy),
                signature: type_name::<Arc<dyn Policy<T, E>>>(),
            },
        );
        Ok(())
    }

    /// Look up the policy registered under `key` for result type `T` and error type `E`
    pub fn get<T, E>(&self, key: &str) -> Result<Arc<dyn Policy<T, E>>, RegistryError>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        entry
            .policy
            .downcast_ref::<Arc<dyn Policy<T, E>>>()
            .cloned()
            .ok_or_else(|| RegistryError::TypeMismatch {
                key: key.to_string(),
            })
    }

    /// Remove a registration; only possible while the registry is still exclusively owned
    pub fn remove(&mut self, key: &str) -> Result<(), RegistryError> {
        self.entries
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Registered keys in sorted order
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for key in self.keys() {
            if let Some(entry) = self.entries.get(key) {
                map.entry(&key, &entry.signature);
            }
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreaker;
    use crate::policy::{NoOpPolicy, PolicyExt};
    use crate::wrap::PolicyWrap;
    use std::time::Duration;

    #[test]
    fn test_duplicate_key_rejected() {
        let mut registry = PolicyRegistry::new();
        registry
            .add::<(), String, _>("breaker", NoOpPolicy::new())
            .unwrap();

        let duplicate = registry.add::<(), String, _>("breaker", NoOpPolicy::new());
        assert_eq!(
            duplicate,
            Err(RegistryError::DuplicateKey("breaker".to_string()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_not_found_and_type_mismatch() {
        let mut registry = PolicyRegistry::new();
        registry
            .add::<String, String, _>("catalog", NoOpPolicy::new())
            .unwrap();

        assert_eq!(
            registry.get::<String, String>("orders").err(),
            Some(RegistryError::NotFound("orders".to_string()))
        );
        assert_eq!(
            registry.get::<u64, String>("catalog").err(),
            Some(RegistryError::TypeMismatch {
                key: "catalog".to_string()
            })
        );
    }

    #[test]
    fn test_heterogeneous_entries() {
        let mut registry = PolicyRegistry::new();
        registry
            .add::<String, std::io::ErrorKind, _>("files", NoOpPolicy::new())
            .unwrap();
        registry
            .add::<u16, String, _>(
                "http",
                CircuitBreaker::<u16, String>::basic(3, Duration::from_secs(5)).unwrap(),
            )
            .unwrap();

        assert_eq!(registry.keys(), vec!["files", "http"]);
        assert!(registry.get::<String, std::io::ErrorKind>("files").is_ok());
        assert!(registry.get::<u16, String>("http").is_ok());

        registry.remove("files").unwrap();
        assert!(!registry.contains_key("files"));
        assert_eq!(
            registry.remove("files"),
            Err(RegistryError::NotFound("files".to_string()))
        );
    }

    #[tokio::test]
    async fn test_registered_wrap_executes() {
        let wrap = PolicyWrap::<u32, String>::builder()
            .policy_key("pipeline")
            .wrap(NoOpPolicy::with_key("a"))
            .wrap(NoOpPolicy::with_key("b"))
            .build()
            .unwrap();

        let mut registry = PolicyRegistry::new();
        registry.add("pipeline", wrap).unwrap();
        let registry = Arc::new(registry);

        let policy = registry.get::<u32, String>("pipeline").unwrap();
        assert_eq!(policy.policy_key(), "pipeline");
        assert_eq!(policy.execute(|| async { Ok(42) }).await, Ok(42));
    }
}
