//! Stale-while-revalidate cache over a shared [`Store`].
//!
//! [`SwrCache::get`] serves an entry straight from the store while it is fresh, serves
//! it stale while scheduling one background refresh per key, and recomputes inline once
//! it has expired. A failing store never fails the read: the fetch runs uncached.
//!
//! ```rust
//! use floodgate::cache::{CacheOptions, SwrCache};
//! use floodgate::clock::SystemClock;
//! use floodgate::store::InMemoryStore;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = SwrCache::new(Arc::new(InMemoryStore::new()), "listings", Arc::new(SystemClock))
//!     .with_record_namespace("listing");
//!
//! let key = cache.namespace_key(&serde_json::json!({ "category": "books", "page": 1 }))?;
//! let rows: Vec<String> = cache
//!     .get(&key, || async { Ok::<_, std::io::Error>(vec!["dune".to_string()]) })
//!     .await?;
//! assert_eq!(rows, vec!["dune"]);
//!
//! // A write to listing 42 drops its record key and every cached listings query.
//! cache.invalidate_one("42").await?;
//! # Ok(())
//! # }
//! ```

mod entry;
mod key;

pub use entry::{CacheEntry, CacheOptions, Freshness};
pub use key::{normalize_query, query_key};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::Store;
use crate::telemetry::{CacheEvent, EventEmitter, PolicyEvent};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One key to pre-populate during [`SwrCache::warmup`].
pub struct WarmupItem<T> {
    key: String,
    fetch: Box<dyn FnOnce() -> BoxFuture<'static, Result<T, BoxError>> + Send>,
}

impl<T> WarmupItem<T> {
    /// Pre-populate `key` with the result of `fetch`.
    pub fn new<F, Fut, E>(key: impl Into<String>, fetch: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self {
            key: key.into(),
            fetch: Box::new(move || {
                Box::pin(async move { fetch().await.map_err(Into::into) }) as BoxFuture<'static, _>
            }),
        }
    }

    /// Store key this item populates.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<T> std::fmt::Debug for WarmupItem<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmupItem").field("key", &self.key).finish_non_exhaustive()
    }
}

/// Result of a warm-up pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmupReport {
    /// Keys fetched and written.
    pub succeeded: usize,
    /// Keys whose fetch or write failed.
    pub failed: usize,
}

#[derive(Debug)]
struct Shared {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    namespace: String,
    record_namespace: String,
    options: CacheOptions,
    emitter: EventEmitter,
    in_flight: Mutex<HashMap<String, JoinHandle<()>>>,
}

/// Stale-while-revalidate cache for one namespace.
///
/// Cheap to clone; clones share the in-flight refresh registry.
#[derive(Debug, Clone)]
pub struct SwrCache {
    shared: Arc<Shared>,
}

impl SwrCache {
    /// Cache for query results under `namespace`, with default [`CacheOptions`].
    pub fn new(store: Arc<dyn Store>, namespace: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        let namespace = namespace.into();
        Self {
            shared: Arc::new(Shared {
                store,
                clock,
                record_namespace: namespace.clone(),
                namespace,
                options: CacheOptions::default(),
                emitter: EventEmitter::null(),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Prefix for single-record keys (default: the namespace itself).
    pub fn with_record_namespace(self, record_namespace: impl Into<String>) -> Self {
        let record_namespace = record_namespace.into();
        self.rebuild(|shared| Shared { record_namespace, ..shared })
    }

    /// Default lifetimes for [`get`](Self::get).
    pub fn with_options(self, options: CacheOptions) -> Self {
        self.rebuild(|shared| Shared { options, ..shared })
    }

    /// Send hit/miss/bypass/refresh-failure events to `emitter`.
    pub fn with_emitter(self, emitter: EventEmitter) -> Self {
        self.rebuild(|shared| Shared { emitter, ..shared })
    }

    fn rebuild(self, f: impl FnOnce(Shared) -> Shared) -> Self {
        let shared = Arc::try_unwrap(self.shared).unwrap_or_else(|shared| Shared {
            store: shared.store.clone(),
            clock: shared.clock.clone(),
            namespace: shared.namespace.clone(),
            record_namespace: shared.record_namespace.clone(),
            options: shared.options,
            emitter: shared.emitter.clone(),
            in_flight: Mutex::new(HashMap::new()),
        });
        Self { shared: Arc::new(f(shared)) }
    }

    /// Namespace of query keys.
    pub fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    /// Default lifetimes.
    pub fn options(&self) -> CacheOptions {
        self.shared.options
    }

    /// Normalized key for a query under this namespace.
    pub fn namespace_key<Q: Serialize + ?Sized>(&self, query: &Q) -> Result<String, StoreError> {
        query_key(&self.shared.namespace, query)
    }

    /// Key for one record, e.g. `listing:42`.
    pub fn record_key(&self, id: impl Display) -> String {
        format!("{}:{}", self.shared.record_namespace, id)
    }

    /// [`get_with`](Self::get_with) using the cache's default options.
    pub async fn get<T, F, Fut, E>(&self, key: &str, fetch: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.get_with(key, self.shared.options, fetch).await
    }

    /// Serve `key` from cache, refreshing or recomputing through `fetch` as needed.
    ///
    /// - fresh: cached data, `fetch` unused;
    /// - stale (or inside the warm-up window): cached data, `fetch` runs once in the
    ///   background unless a refresh for `key` is already in flight;
    /// - absent or expired: `fetch` runs inline and the result is written back;
    /// - store read error: `fetch` runs inline, nothing is written.
    ///
    /// Only `fetch` errors are returned.
    pub async fn get_with<T, F, Fut, E>(&self, key: &str, options: CacheOptions, fetch: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let cached = match self.shared.read::<T>(key).await {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache read failed; fetching directly");
                self.shared.emit(|source| CacheEvent::Bypass { source });
                return fetch().await;
            }
        };

        let now = self.shared.clock.now_millis();
        if let Some(entry) = cached {
            match entry.freshness(now, options.warmup_threshold()) {
                Freshness::Fresh => {
                    self.shared.emit(|source| CacheEvent::Hit { source, stale: false });
                    return Ok(entry.data);
                }
                Freshness::Warming => {
                    self.shared.emit(|source| CacheEvent::Hit { source, stale: false });
                    self.schedule_refresh(key, options, fetch);
                    return Ok(entry.data);
                }
                Freshness::Stale => {
                    self.shared.emit(|source| CacheEvent::Hit { source, stale: true });
                    self.schedule_refresh(key, options, fetch);
                    return Ok(entry.data);
                }
                Freshness::Expired => {}
            }
        }

        self.shared.emit(|source| CacheEvent::Miss { source });
        self.fetch_and_cache(key, options, fetch).await
    }

    /// Run `fetch`, write the result under `key` and return it.
    ///
    /// A failed write is logged; the fetched value is still returned.
    pub async fn fetch_and_cache<T, F, Fut, E>(&self, key: &str, options: CacheOptions, fetch: F) -> Result<T, E>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let data = fetch().await?;
        let written = match serde_json::to_value(&data) {
            Ok(payload) => self.shared.write(key, payload, &options).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            tracing::warn!(key = %key, error = %e, "cache write failed");
        }
        Ok(data)
    }

    fn schedule_refresh<T, F, Fut, E>(&self, key: &str, options: CacheOptions, fetch: F)
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let mut registry = self.shared.registry();
        if registry.get(key).is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let shared = self.shared.clone();
        let task_key = key.to_string();
        let handle = tokio::spawn(async move {
            match fetch().await {
                Ok(data) => {
                    let written = match serde_json::to_value(&data) {
                        Ok(payload) => shared.write(&task_key, payload, &options).await,
                        Err(e) => Err(e.into()),
                    };
                    if let Err(e) = written {
                        tracing::warn!(key = %task_key, error = %e, "background refresh write failed");
                        shared.emit(|source| CacheEvent::RefreshFailed { source });
                    }
                }
                Err(e) => {
                    tracing::warn!(key = %task_key, error = %e, "background refresh failed");
                    shared.emit(|source| CacheEvent::RefreshFailed { source });
                }
            }
            shared.registry().remove(&task_key);
        });
        registry.insert(key.to_string(), handle);
    }

    /// Delete every key matching `pattern`.
    ///
    /// Stores without key scans cannot match patterns; the whole namespace is
    /// invalidated instead by bumping its generation.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<(), StoreError> {
        let store = &self.shared.store;
        if !store.supports_key_scan() {
            let generation = self.shared.bump_generation().await?;
            tracing::debug!(namespace = %self.shared.namespace, generation, "namespace generation bumped");
            return Ok(());
        }

        let keys = store.keys(pattern).await?;
        for key in &keys {
            store.delete(key).await?;
        }
        tracing::debug!(pattern = %pattern, removed = keys.len(), "cache keys invalidated");
        Ok(())
    }

    /// Drop every cached query result in the namespace.
    pub async fn invalidate_all(&self) -> Result<(), StoreError> {
        self.invalidate_pattern(&format!("{}:v2:*", self.shared.namespace)).await
    }

    /// Drop one record's key. Cached query results are left in place; pair
    /// with [`invalidate_all`](Self::invalidate_all) when the record's change
    /// affects listings.
    pub async fn invalidate_one(&self, id: impl Display) -> Result<(), StoreError> {
        let key = self.record_key(id);
        self.shared.store.delete(&key).await?;
        tracing::debug!(key = %key, "cache record invalidated");
        Ok(())
    }

    /// Populate `items` concurrently. One failure does not stop the others.
    pub async fn warmup<T>(&self, items: Vec<WarmupItem<T>>) -> WarmupReport
    where
        T: Serialize + Send + 'static,
    {
        let options = self.shared.options;
        let runs = items.into_iter().map(|item| async move {
            let WarmupItem { key, fetch } = item;
            match self.fetch_and_cache(&key, options, fetch).await {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "cache warm-up failed");
                    false
                }
            }
        });

        let outcomes = futures::future::join_all(runs).await;
        let succeeded = outcomes.iter().filter(|ok| **ok).count();
        WarmupReport { succeeded, failed: outcomes.len() - succeeded }
    }

    /// Number of background refreshes still running.
    pub fn in_flight(&self) -> usize {
        self.shared.registry().values().filter(|handle| !handle.is_finished()).count()
    }

    /// Abort every outstanding background refresh.
    pub fn shutdown(&self) {
        let mut registry = self.shared.registry();
        for (_, handle) in registry.drain() {
            handle.abort();
        }
    }
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: impl FnOnce(String) -> CacheEvent) {
        self.emitter.emit(PolicyEvent::Cache(event(self.namespace.clone())));
    }

    fn generation_key(&self) -> String {
        format!("{}:generation", self.namespace)
    }

    /// Current namespace generation; always 0 when the store can scan keys.
    async fn generation(&self) -> Result<u64, StoreError> {
        if self.store.supports_key_scan() {
            return Ok(0);
        }
        match self.store.get(&self.generation_key()).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(0),
        }
    }

    async fn bump_generation(&self) -> Result<u64, StoreError> {
        let next = self.generation().await?.saturating_add(1);
        self.store.set(&self.generation_key(), next.to_string(), GENERATION_TTL).await?;
        Ok(next)
    }

    /// Live entry for `key`. Undecodable and superseded entries read as absent.
    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>, StoreError> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        let entry = match serde_json::from_str::<CacheEntry<T>>(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "ignoring undecodable cache entry");
                return Ok(None);
            }
        };
        if entry.version != self.generation().await? {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn write(&self, key: &str, payload: Value, options: &CacheOptions) -> Result<(), StoreError> {
        let version = self.generation().await?;
        let entry = CacheEntry::new(payload, self.clock.now_millis(), options, version);
        let raw = serde_json::to_string(&entry)?;
        self.store.set(key, raw, options.ttl()).await
    }
}

/// Generation counters outlive any entry they version.
const GENERATION_TTL: std::time::Duration = std::time::Duration::from_secs(7 * 24 * 60 * 60);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const MINUTE: u64 = 60_000;

    fn cache_at(start: u64) -> (SwrCache, InMemoryStore, ManualClock) {
        let clock = ManualClock::new(start);
        let store = InMemoryStore::with_clock(Arc::new(clock.clone()));
        let cache = SwrCache::new(Arc::new(store.clone()), "listings", Arc::new(clock.clone()))
            .with_record_namespace("listing");
        (cache, store, clock)
    }

    async fn settle(cache: &SwrCache) {
        for _ in 0..100 {
            if cache.in_flight() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn miss_then_fresh_hit() {
        let (cache, _store, _clock) = cache_at(0);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let value: u32 = cache
                .get("listings:v2:{}", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(7)
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_entry_is_served_and_refreshed_once() {
        let (cache, _store, clock) = cache_at(0);
        cache.get("k", || async { Ok::<_, String>(1u32) }).await.unwrap();

        clock.advance(3 * MINUTE);
        let served: u32 = cache.get("k", || async { Ok::<_, String>(2u32) }).await.unwrap();
        assert_eq!(served, 1);
        settle(&cache).await;

        let refreshed: u32 = cache.get("k", || async { Ok::<_, String>(3u32) }).await.unwrap();
        assert_eq!(refreshed, 2);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_entry() {
        let (cache, _store, clock) = cache_at(0);
        cache.get("k", || async { Ok::<_, String>(1u32) }).await.unwrap();

        clock.advance(3 * MINUTE);
        let served: u32 = cache.get("k", || async { Err::<u32, _>("db down".to_string()) }).await.unwrap();
        assert_eq!(served, 1);
        settle(&cache).await;

        let again: u32 = cache.get("k", || async { Ok::<_, String>(9u32) }).await.unwrap();
        assert_eq!(again, 1);
    }

    #[tokio::test]
    async fn expired_entry_is_recomputed_inline() {
        let (cache, _store, clock) = cache_at(0);
        cache.get("k", || async { Ok::<_, String>(1u32) }).await.unwrap();

        clock.advance(5 * MINUTE);
        let value: u32 = cache.get("k", || async { Ok::<_, String>(2u32) }).await.unwrap();
        assert_eq!(value, 2);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn fetch_errors_surface_on_miss() {
        let (cache, store, _clock) = cache_at(0);
        let err = cache.get("k", || async { Err::<u32, _>("boom".to_string()) }).await.unwrap_err();
        assert_eq!(err, "boom");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn invalidate_one_spares_unrelated_keys() {
        let (cache, store, _clock) = cache_at(0);
        let query = cache.namespace_key(&serde_json::json!({ "page": 1 })).unwrap();
        cache.get(&query, || async { Ok::<_, String>(vec![1u32]) }).await.unwrap();
        cache.get(&cache.record_key(42), || async { Ok::<_, String>(42u32) }).await.unwrap();
        cache.get(&cache.record_key(7), || async { Ok::<_, String>(7u32) }).await.unwrap();

        cache.invalidate_one(42).await.unwrap();
        let mut left = store.keys("*").await.unwrap();
        left.sort();
        assert_eq!(left, vec!["listing:7".to_string(), query]);
    }

    #[derive(Debug)]
    struct NoScan(InMemoryStore);

    #[async_trait]
    impl Store for NoScan {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
            self.0.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.0.delete(key).await
        }
    }

    #[tokio::test]
    async fn generation_bump_invalidates_without_key_scan() {
        let clock = ManualClock::new(0);
        let store = NoScan(InMemoryStore::with_clock(Arc::new(clock.clone())));
        let cache = SwrCache::new(Arc::new(store), "listings", Arc::new(clock));

        cache.get("listings:v2:{}", || async { Ok::<_, String>(1u32) }).await.unwrap();
        cache.invalidate_all().await.unwrap();

        let value: u32 = cache.get("listings:v2:{}", || async { Ok::<_, String>(2u32) }).await.unwrap();
        assert_eq!(value, 2);
        let value: u32 = cache.get("listings:v2:{}", || async { Ok::<_, String>(3u32) }).await.unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn warmup_reports_partial_failure() {
        let (cache, store, _clock) = cache_at(0);
        let items = vec![
            WarmupItem::new("listings:v2:{}", || async { Ok::<_, std::io::Error>(1u32) }),
            WarmupItem::new("listings:v2:{\"page\":2}", || async {
                Err::<u32, _>(std::io::Error::new(std::io::ErrorKind::Other, "timeout"))
            }),
        ];
        let report = cache.warmup(items).await;
        assert_eq!(report, WarmupReport { succeeded: 1, failed: 1 });
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_aborts_pending_refreshes() {
        let (cache, _store, clock) = cache_at(0);
        cache.get("k", || async { Ok::<_, String>(1u32) }).await.unwrap();

        clock.advance(3 * MINUTE);
        cache
            .get("k", || async {
                futures::future::pending::<()>().await;
                Ok::<_, String>(2u32)
            })
            .await
            .unwrap();
        assert_eq!(cache.in_flight(), 1);

        cache.shutdown();
        assert_eq!(cache.in_flight(), 0);
    }
}
