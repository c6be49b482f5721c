//! Extraction cache
//!
//! Memoizes capability results per `(extension, capability, ordered args)`
//! and coalesces identical concurrent requests into a single backend call.
//! Only successes are stored; every caller waiting on a coalesced call gets
//! the same outcome, success or failure.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::core::error::{ExtensionError, Result};
use crate::plugin::capability::Capability;

type SharedFetch = Shared<BoxFuture<'static, Result<Value>>>;

/// Identity of a cached call.
///
/// `generation` identifies one load of the extension; a reloaded instance
/// never joins or reads calls made against its predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub extension_id: String,
    pub generation: u64,
    pub capability: Capability,
    /// Canonical JSON of the ordered argument tuple
    args: String,
}

impl CacheKey {
    pub fn new(extension_id: &str, generation: u64, capability: Capability, ordered_args: &[Value]) -> Self {
        Self {
            extension_id: extension_id.to_string(),
            generation,
            capability,
            args: Value::Array(ordered_args.to_vec()).to_string(),
        }
    }
}

/// Where a result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// Served from a stored entry
    Hit,
    /// This caller ran the backend
    Miss,
    /// Joined a call another caller started
    Coalesced,
    /// Capability is never cached
    Bypass,
}

struct CacheEntry {
    value: Value,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.created_at.elapsed() < self.ttl
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    in_flight: HashMap<CacheKey, SharedFetch>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
}

/// Shared, cloneable handle to the cache
#[derive(Clone, Default)]
pub struct ExtractionCache {
    inner: Arc<Inner>,
}

impl ExtractionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `key` from the cache, join an identical in-flight call, or run `fetch`.
    ///
    /// `ttl` of `None` bypasses the cache entirely, including coalescing.
    /// `should_store` is consulted once the backend returns; a `false` answer
    /// hands the result to the waiting callers without storing it.
    pub async fn get_or_fetch<F, Fut, S>(
        &self,
        key: CacheKey,
        ttl: Option<Duration>,
        should_store: S,
        fetch: F,
    ) -> (Result<Value>, CacheSource)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
        S: FnOnce() -> bool + Send + 'static,
    {
        let ttl = match ttl {
            Some(ttl) => ttl,
            None => return (fetch().await, CacheSource::Bypass),
        };

        let (shared, source) = {
            let mut state = self.inner.lock();

            match state.entries.get(&key) {
                Some(entry) if entry.is_fresh() => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    return (Ok(entry.value.clone()), CacheSource::Hit);
                }
                Some(_) => {
                    state.entries.remove(&key);
                }
                None => {}
            }

            if let Some(existing) = state.in_flight.get(&key) {
                self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
                (existing.clone(), CacheSource::Coalesced)
            } else {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                let shared = self.spawn_fetch(key.clone(), ttl, should_store, fetch());
                state.in_flight.insert(key, shared.clone());
                (shared, CacheSource::Miss)
            }
        };

        (shared.await, source)
    }

    // The backend call runs on its own task so bookkeeping completes even if
    // every waiting caller is cancelled.
    fn spawn_fetch<Fut, S>(&self, key: CacheKey, ttl: Duration, should_store: S, fut: Fut) -> SharedFetch
    where
        Fut: Future<Output = Result<Value>> + Send + 'static,
        S: FnOnce() -> bool + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = AssertUnwindSafe(fut)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(ExtensionError::ExecutionError("extension call panicked".to_string()))
                });

            let store = result.is_ok() && should_store();
            let mut state = inner.lock();
            state.in_flight.remove(&key);
            if let (true, Ok(value)) = (store, &result) {
                state.entries.insert(
                    key,
                    CacheEntry {
                        value: value.clone(),
                        created_at: Instant::now(),
                        ttl,
                    },
                );
            }
            result
        });

        async move {
            task.await.unwrap_or_else(|e| {
                Err(ExtensionError::ExecutionError(format!("extension call aborted: {}", e)))
            })
        }
        .boxed()
        .shared()
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Drop every entry of one extension and forget its in-flight calls.
    ///
    /// Callers already waiting on a forgotten call still get its outcome;
    /// later callers start a fresh call.
    pub fn clear_extension(&self, extension_id: &str) -> usize {
        let mut state = self.inner.lock();
        let before = state.entries.len();
        state.entries.retain(|k, _| k.extension_id != extension_id);
        state.in_flight.retain(|k, _| k.extension_id != extension_id);
        before - state.entries.len()
    }

    pub fn purge_expired(&self) -> usize {
        let mut state = self.inner.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.is_fresh());
        before - state.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.lock();
        CacheStats {
            entries: state.entries.len(),
            in_flight: state.in_flight.len(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            coalesced: self.inner.coalesced.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    const TTL: Option<Duration> = Some(Duration::from_secs(60));

    fn key(args: &[Value]) -> CacheKey {
        CacheKey::new("sample", 1, Capability::ExtractStream, args)
    }

    #[tokio::test]
    async fn test_concurrent_identical_calls_coalesce() {
        let cache = ExtractionCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(key(&[json!("https://voe.sx/e/1")]), TTL, || true, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!({"url": "https://cdn/master.m3u8"}))
                    })
                    .await
            }));
        }

        for handle in handles {
            let (result, _) = handle.await.unwrap();
            assert_eq!(result.unwrap()["url"], "https://cdn/master.m3u8");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_hit_after_store() {
        let cache = ExtractionCache::new();
        let (first, source) = cache
            .get_or_fetch(key(&[json!(1)]), TTL, || true, || async { Ok(json!("a")) })
            .await;
        assert_eq!(first.unwrap(), json!("a"));
        assert_eq!(source, CacheSource::Miss);

        let (second, source) = cache
            .get_or_fetch(key(&[json!(1)]), TTL, || true, || async { Ok(json!("b")) })
            .await;
        assert_eq!(second.unwrap(), json!("a"));
        assert_eq!(source, CacheSource::Hit);
    }

    #[tokio::test]
    async fn test_different_args_do_not_collide() {
        let cache = ExtractionCache::new();
        cache
            .get_or_fetch(key(&[json!("x"), json!(1)]), TTL, || true, || async { Ok(json!("one")) })
            .await;
        let (result, source) = cache
            .get_or_fetch(key(&[json!("x"), json!(2)]), TTL, || true, || async { Ok(json!("two")) })
            .await;
        assert_eq!(result.unwrap(), json!("two"));
        assert_eq!(source, CacheSource::Miss);
    }

    #[tokio::test]
    async fn test_ttl_expiry_refetches() {
        let cache = ExtractionCache::new();
        let ttl = Some(Duration::from_millis(30));

        cache.get_or_fetch(key(&[]), ttl, || true, || async { Ok(json!(1)) }).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let (result, source) = cache
            .get_or_fetch(key(&[]), ttl, || true, || async { Ok(json!(2)) })
            .await;
        assert_eq!(result.unwrap(), json!(2));
        assert_eq!(source, CacheSource::Miss);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = ExtractionCache::new();
        let (result, _) = cache
            .get_or_fetch(key(&[]), TTL, || true, || async {
                Err(ExtensionError::NetworkError("reset".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(cache.stats().entries, 0);

        let (result, source) = cache
            .get_or_fetch(key(&[]), TTL, || true, || async { Ok(json!("ok")) })
            .await;
        assert_eq!(result.unwrap(), json!("ok"));
        assert_eq!(source, CacheSource::Miss);
    }

    #[tokio::test]
    async fn test_should_store_false_discards() {
        let cache = ExtractionCache::new();
        let (result, _) = cache
            .get_or_fetch(key(&[]), TTL, || false, || async { Ok(json!("late")) })
            .await;
        assert_eq!(result.unwrap(), json!("late"));
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_bypass_runs_every_time() {
        let cache = ExtractionCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let (_, source) = cache
                .get_or_fetch(key(&[]), None, || true, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                })
                .await;
            assert_eq!(source, CacheSource::Bypass);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_clear_extension() {
        let cache = ExtractionCache::new();
        cache.get_or_fetch(key(&[]), TTL, || true, || async { Ok(json!(1)) }).await;
        cache
            .get_or_fetch(
                CacheKey::new("other", 1, Capability::Search, &[]),
                TTL,
                || true,
                || async { Ok(json!(2)) },
            )
            .await;

        assert_eq!(cache.clear_extension("sample"), 1);
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test]
    async fn test_cleared_extension_does_not_join_old_call() {
        let cache = ExtractionCache::new();
        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(key(&[]), TTL, || true, || async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Err(ExtensionError::NetworkError("old backend".to_string()))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.stats().in_flight, 1);

        cache.clear_extension("sample");
        assert_eq!(cache.stats().in_flight, 0);

        let (result, source) = cache
            .get_or_fetch(key(&[]), TTL, || true, || async { Ok(json!("new")) })
            .await;
        assert_eq!(source, CacheSource::Miss);
        assert_eq!(result.unwrap(), json!("new"));

        let (old, _) = slow.await.unwrap();
        assert!(old.is_err());
    }

    #[tokio::test]
    async fn test_generations_do_not_share_entries() {
        let cache = ExtractionCache::new();
        let first = CacheKey::new("sample", 1, Capability::Search, &[json!("q")]);
        let second = CacheKey::new("sample", 2, Capability::Search, &[json!("q")]);

        cache.get_or_fetch(first, TTL, || true, || async { Ok(json!("one")) }).await;
        let (result, source) = cache
            .get_or_fetch(second, TTL, || true, || async { Ok(json!("two")) })
            .await;
        assert_eq!(source, CacheSource::Miss);
        assert_eq!(result.unwrap(), json!("two"));
    }
}
