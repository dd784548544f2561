use async_trait::async_trait;
use floodgate::clock::ManualClock;
use floodgate::error::StoreError;
use floodgate::store::{BucketScriptArgs, BucketScriptReply, InMemoryStore, ScriptingStore, Store};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 2023-11-14T22:14:00Z, on a minute boundary.
pub const T0: u64 = 1_700_000_040_000;

/// A manual clock plus an in-memory store expiring on it.
pub fn store_at(start: u64) -> (InMemoryStore, ManualClock) {
    let clock = ManualClock::new(start);
    let store = InMemoryStore::with_clock(Arc::new(clock.clone()));
    (store, clock)
}

/// A store that can be switched into an outage; every call then fails.
#[derive(Debug, Clone)]
pub struct FailingStore {
    inner: InMemoryStore,
    down: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl FailingStore {
    pub fn new(inner: InMemoryStore) -> Self {
        Self { inner, down: Arc::new(AtomicBool::new(false)), calls: Arc::new(AtomicUsize::new(0)) }
    }

    /// A store that is already down.
    pub fn down() -> Self {
        let store = Self::new(InMemoryStore::new());
        store.set_down(true);
        store
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn gate(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.gate()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        self.gate()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.gate()?;
        self.inner.delete(key).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.gate()?;
        self.inner.keys(pattern).await
    }

    fn supports_key_scan(&self) -> bool {
        true
    }
}

#[async_trait]
impl ScriptingStore for FailingStore {
    async fn eval_token_bucket(
        &self,
        key: &str,
        args: BucketScriptArgs,
    ) -> Result<BucketScriptReply, StoreError> {
        self.gate()?;
        self.inner.eval_token_bucket(key, args).await
    }
}

/// Wait until every detached emission task has had a chance to run.
pub async fn drain_events() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
