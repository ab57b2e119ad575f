//! Key-based memoization of successful outcomes
//!
//! The cache key is derived from the [`Context`], by default its operation key.
//! A hit returns the stored value without running the operation. A miss runs
//! the operation and stores a successful value with its TTL. Faults are never
//! cached, and a context without a usable key bypasses the cache entirely.
//!
//! Concurrent misses for the same key are collapsed (single-flight): the first
//! caller runs the operation while later callers for that key wait, then read
//! the value it stored. If the first caller fails, nothing is stored and the
//! next waiter runs the operation itself.

use crate::context::{generated_policy_key, Context};
use crate::error::{ConfigError, Fault};
use crate::outcome::Outcome;
use crate::policy::{Operation, Policy};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Storage backend for [`CachePolicy`]
pub trait CacheProvider<T>: Send + Sync {
    /// Unexpired value stored under `key`
    fn get(&self, key: &str) -> Option<T>;

    /// Store `value` under `key` for `ttl`
    fn put(&self, key: &str, value: T, ttl: Duration);

    /// Drop the value stored under `key`, returning whether one was present
    fn invalidate(&self, key: &str) -> bool;
}

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    inserted: Instant,
    ttl: Duration,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted) >= self.ttl
    }
}

/// In-process provider; expired entries are dropped lazily on read or by
/// [`purge_expired`](Self::purge_expired)
#[derive(Debug)]
pub struct MemoryCacheProvider<T> {
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
}

impl<T> MemoryCacheProvider<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Remove expired entries, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Number of stored entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl<T> Default for MemoryCacheProvider<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CacheProvider<T> for MemoryCacheProvider<T>
where
    T: Clone + Send + Sync,
{
    fn get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    fn put(&self, key: &str, value: T, ttl: Duration) {
        self.entries.lock().insert(
            key.to_string(),
            CacheEntry {
                value,
                inserted: Instant::now(),
                ttl,
            },
        );
    }

    fn invalidate(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }
}

type KeyFn = Arc<dyn Fn(&Context) -> Option<String> + Send + Sync>;
type TtlFn<T> = Arc<dyn Fn(&T) -> Duration + Send + Sync>;
type KeyHook = Arc<dyn Fn(&Context, &str) + Send + Sync>;
type PutHook = Arc<dyn Fn(&Context, &str, Duration) + Send + Sync>;
type Gates = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Per-key single-flight gate; unregisters itself when its last holder leaves
struct Gate<'a> {
    key: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    gates: &'a Gates,
}

impl<'a> Gate<'a> {
    fn enter(gates: &'a Gates, key: &str) -> Self {
        let lock = Arc::clone(gates.lock().entry(key.to_string()).or_default());
        Self {
            key: key.to_string(),
            lock,
            gates,
        }
    }
}

impl Drop for Gate<'_> {
    fn drop(&mut self) {
        let mut gates = self.gates.lock();
        // One reference in the map, one here
        if Arc::strong_count(&self.lock) == 2 {
            gates.remove(&self.key);
        }
    }
}

/// Serves repeated executions from a [`CacheProvider`]
pub struct CachePolicy<T> {
    key: String,
    provider: Arc<dyn CacheProvider<T>>,
    ttl: Duration,
    ttl_for: Option<TtlFn<T>>,
    key_fn: KeyFn,
    on_cache_hit: Option<KeyHook>,
    on_cache_miss: Option<KeyHook>,
    on_cache_put: Option<PutHook>,
    in_flight: Arc<Gates>,
}

impl<T> CachePolicy<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Cache backed by a fresh [`MemoryCacheProvider`]
    pub fn in_memory(ttl: Duration) -> Result<Self, ConfigError> {
        Self::builder(Arc::new(MemoryCacheProvider::new()), ttl).build()
    }

    pub fn builder(provider: Arc<dyn CacheProvider<T>>, ttl: Duration) -> CachePolicyBuilder<T> {
        CachePolicyBuilder {
            key: None,
            provider,
            ttl,
            ttl_for: None,
            key_fn: None,
            on_cache_hit: None,
            on_cache_miss: None,
            on_cache_put: None,
        }
    }

    pub fn provider(&self) -> &Arc<dyn CacheProvider<T>> {
        &self.provider
    }

    fn lookup(&self, cache_key: &str, ctx: &Context) -> Option<T> {
        let value = self.provider.get(cache_key)?;
        trace!(policy_key = %self.key, cache_key, "cache hit");
        if let Some(hook) = &self.on_cache_hit {
            hook(ctx, cache_key);
        }
        Some(value)
    }

    fn store(&self, cache_key: &str, value: &T, ctx: &Context) {
        let ttl = self.ttl_for.as_ref().map_or(self.ttl, |ttl_for| ttl_for(value));
        if ttl.is_zero() {
            return;
        }
        self.provider.put(cache_key, value.clone(), ttl);
        if let Some(hook) = &self.on_cache_put {
            hook(ctx, cache_key, ttl);
        }
    }
}

impl<T> fmt::Debug for CachePolicy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T, E> Policy<T, E> for CachePolicy<T>
where
    T: Clone + Send + Sync + 'static,
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
        let cache_key = match (self.key_fn)(&ctx) {
            Some(key) if !key.is_empty() => key,
            _ => return operation.invoke(ctx, cancel).await,
        };

        if let Some(value) = self.lookup(&cache_key, &ctx) {
            return Ok(value);
        }

        let gate = Gate::enter(&self.in_flight, &cache_key);
        let _leader = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Fault::Cancelled),
            guard = gate.lock.lock() => guard,
        };

        // Another caller may have filled the entry while this one waited
        if let Some(value) = self.lookup(&cache_key, &ctx) {
            return Ok(value);
        }

        trace!(policy_key = %self.key, cache_key = %cache_key, "cache miss");
        if let Some(hook) = &self.on_cache_miss {
            hook(&ctx, &cache_key);
        }

        let outcome = operation.invoke(ctx.clone(), cancel).await;
        if let Ok(value) = &outcome {
            self.store(&cache_key, value, &ctx);
        }
        outcome
    }
}

/// Builder for [`CachePolicy`]
pub struct CachePolicyBuilder<T> {
    key: Option<String>,
    provider: Arc<dyn CacheProvider<T>>,
    ttl: Duration,
    ttl_for: Option<TtlFn<T>>,
    key_fn: Option<KeyFn>,
    on_cache_hit: Option<KeyHook>,
    on_cache_miss: Option<KeyHook>,
    on_cache_put: Option<PutHook>,
}

impl<T> CachePolicyBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn policy_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Derive the cache key from the context (default: the operation key)
    pub fn key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) -> Option<String> + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(f));
        self
    }

    /// Per-value TTL; a zero duration skips storing the value
    pub fn ttl_for<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) -> Duration + Send + Sync + 'static,
    {
        self.ttl_for = Some(Arc::new(f));
        self
    }

    pub fn on_cache_hit<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Context, &str) + Send + Sync + 'static,
    {
        self.on_cache_hit = Some(Arc::new(hook));
        self
    }

    pub fn on_cache_miss<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Context, &str) + Send + Sync + 'static,
    {
        self.on_cache_miss = Some(Arc::new(hook));
        self
    }

    pub fn on_cache_put<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Context, &str, Duration) + Send + Sync + 'static,
    {
        self.on_cache_put = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<CachePolicy<T>, ConfigError> {
        if self.ttl.is_zero() {
            return Err(ConfigError::Zero { field: "ttl" });
        }
        let key_fn = self.key_fn.unwrap_or_else(|| {
            Arc::new(|ctx: &Context| ctx.operation_key().map(str::to_string))
        });
        Ok(CachePolicy {
            key: self.key.unwrap_or_else(|| generated_policy_key("Cache")),
            provider: self.provider,
            ttl: self.ttl,
            ttl_for: self.ttl_for,
            key_fn,
            on_cache_hit: self.on_cache_hit,
            on_cache_miss: self.on_cache_miss,
            on_cache_put: self.on_cache_put,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting(
        calls: &Arc<AtomicU32>,
    ) -> impl Fn(Context) -> futures::future::Ready<Result<String, String>>
           + Send
           + Sync
           + 'static {
        let calls = Arc::clone(calls);
        move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            futures::future::ready(Ok(format!("value-{n}")))
        }
    }

    #[test]
    fn test_zero_ttl_rejected() {
        assert_eq!(
            CachePolicy::<String>::in_memory(Duration::ZERO).err(),
            Some(ConfigError::Zero { field: "ttl" })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_provider_expiry() {
        let provider = MemoryCacheProvider::new();
        provider.put("a", 1, Duration::from_secs(10));
        provider.put("b", 2, Duration::from_secs(60));
        assert_eq!(provider.get("a"), Some(1));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(provider.get("a"), None);
        assert_eq!(provider.len(), 1, "expired entry removed on read");

        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(provider.purge_expired(), 1);
        assert!(provider.is_empty());

        provider.put("c", 3, Duration::from_secs(1));
        assert!(provider.invalidate("c"));
        assert!(!provider.invalidate("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_within_ttl_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let cache = CachePolicy::<String>::in_memory(Duration::from_secs(300)).unwrap();

        let first: Outcome<String, String> = cache
            .execute_with_context(Context::with_operation_key("GetCustomer-1"), counting(&calls))
            .await;
        tokio::time::advance(Duration::from_secs(60)).await;
        let second: Outcome<String, String> = cache
            .execute_with_context(Context::with_operation_key("GetCustomer-1"), counting(&calls))
            .await;

        assert_eq!(first, Ok("value-1".to_string()));
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let other: Outcome<String, String> = cache
            .execute_with_context(Context::with_operation_key("GetCustomer-2"), counting(&calls))
            .await;
        assert_eq!(other, Ok("value-2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_reexecutes() {
        let calls = Arc::new(AtomicU32::new(0));
        let cache = CachePolicy::<String>::in_memory(Duration::from_secs(300)).unwrap();
        let ctx = || Context::with_operation_key("catalog");

        let _: Outcome<String, String> = cache.execute_with_context(ctx(), counting(&calls)).await;
        tokio::time::advance(Duration::from_secs(300)).await;
        let refreshed: Outcome<String, String> =
            cache.execute_with_context(ctx(), counting(&calls)).await;

        assert_eq!(refreshed, Ok("value-2".to_string()));
    }

    #[tokio::test]
    async fn test_faults_not_cached_and_missing_key_bypasses() {
        let cache = CachePolicy::<String>::in_memory(Duration::from_secs(300)).unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let counter = Arc::clone(&calls);
            let failed: Outcome<String, String> = cache
                .execute_with_context(Context::with_operation_key("flaky"), move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err("unavailable".to_string()) }
                })
                .await;
            assert!(failed.is_err());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let calls = Arc::new(AtomicU32::new(0));
        for _ in 0..2 {
            let _: Outcome<String, String> = cache
                .execute_with_context(Context::new(), counting(&calls))
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2, "no operation key, no caching");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_single_flight() {
        let cache = Arc::new(CachePolicy::<String>::in_memory(Duration::from_secs(60)).unwrap());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .execute_with_context(Context::with_operation_key("report"), move |_| {
                        let calls = Arc::clone(&calls);
                        async move {
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                            Ok::<_, String>(format!("report-{n}"))
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok("report-1".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.in_flight.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_fn_ttl_for_and_hooks() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (hit, miss, put) = (Arc::clone(&events), Arc::clone(&events), Arc::clone(&events));
        let cache = CachePolicy::<String>::builder(
            Arc::new(MemoryCacheProvider::new()),
            Duration::from_secs(300),
        )
        .key_fn(|ctx| {
            ctx.get("CustomerId")
                .and_then(|v| v.as_str().map(|id| format!("customer:{id}")))
        })
        .ttl_for(|value: &String| {
            if value.is_empty() {
                Duration::ZERO
            } else {
                Duration::from_secs(30)
            }
        })
        .on_cache_hit(move |_, key| hit.lock().push(format!("hit {key}")))
        .on_cache_miss(move |_, key| miss.lock().push(format!("miss {key}")))
        .on_cache_put(move |_, key, ttl| put.lock().push(format!("put {key} {}s", ttl.as_secs())))
        .build()
        .unwrap();

        let ctx = || Context::new().with_data("CustomerId", "12345");
        let calls = Arc::new(AtomicU32::new(0));
        let _: Outcome<String, String> = cache.execute_with_context(ctx(), counting(&calls)).await;
        let _: Outcome<String, String> = cache.execute_with_context(ctx(), counting(&calls)).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        let _: Outcome<String, String> = cache.execute_with_context(ctx(), counting(&calls)).await;

        assert_eq!(
            *events.lock(),
            vec![
                "miss customer:12345",
                "put customer:12345 30s",
                "hit customer:12345",
                "miss customer:12345",
                "put customer:12345 30s",
            ]
        );

        let empty: Outcome<String, String> = cache
            .execute_with_context(
                Context::new().with_data("CustomerId", "empty"),
                |_| async { Ok(String::new()) },
            )
            .await;
        assert_eq!(empty, Ok(String::new()));
        assert!(cache.provider().get("customer:empty").is_none());
    }
}
