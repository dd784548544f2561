use super::{
    run_bucket_script, ttl_from_millis, BucketScriptArgs, BucketScriptReply, BucketState,
    ScriptingStore, Store,
};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Clock time between sweeps of expired slots on the write path.
const SWEEP_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct Slots {
    map: HashMap<String, Slot>,
    next_sweep_at: u64,
}

impl Slots {
    fn live_value(&self, key: &str, now: u64) -> Option<String> {
        self.map.get(key).filter(|slot| slot.expires_at > now).map(|slot| slot.value.clone())
    }

    fn sweep(&mut self, now: u64) -> usize {
        let before = self.map.len();
        self.map.retain(|_, slot| slot.expires_at > now);
        self.next_sweep_at = now.saturating_add(SWEEP_INTERVAL_MS);
        before - self.map.len()
    }

    /// Insert `slot`, first reclaiming expired slots if a sweep is due.
    fn insert(&mut self, key: &str, slot: Slot, now: u64) {
        if now >= self.next_sweep_at {
            self.sweep(now);
        }
        self.map.insert(key.to_string(), slot);
    }
}

/// Process-local store with per-key expiry.
///
/// Implements both [`Store`] and [`ScriptingStore`]; the bucket script runs while the
/// map lock is held, so it is atomic with respect to every other call on this store.
/// Clones share the same map. Expired slots are reclaimed on the write path at
/// most once per second of clock time, so abandoned keys do not accumulate.
#[derive(Clone, Debug)]
pub struct InMemoryStore {
    data: Arc<Mutex<Slots>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create an empty store on the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store whose expiry follows `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { data: Arc::new(Mutex::new(Slots::default())), clock }
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.lock().map.values().filter(|slot| slot.expires_at > now).count()
    }

    /// Returns true if no live keys are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries now instead of waiting for the next write.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        self.lock().sweep(now)
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // A panic while holding the lock cannot leave a half-written slot behind.
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expiry(now: u64, ttl: Duration) -> u64 {
        now.saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_millis();
        Ok(self.lock().live_value(key, now))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let expires_at = Self::expiry(now, ttl);
        self.lock().insert(key, Slot { value, expires_at }, now);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock().map.remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now_millis();
        let mut keys: Vec<String> = self
            .lock()
            .map
            .iter()
            .filter(|(key, slot)| slot.expires_at > now && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn supports_key_scan(&self) -> bool {
        true
    }
}

#[async_trait]
impl ScriptingStore for InMemoryStore {
    async fn eval_token_bucket(
        &self,
        key: &str,
        args: BucketScriptArgs,
    ) -> Result<BucketScriptReply, StoreError> {
        let now = self.clock.now_millis();
        let mut guard = self.lock();

        let current = match guard.live_value(key, now) {
            Some(raw) => Some(serde_json::from_str::<BucketState>(&raw)?),
            None => None,
        };
        let (next, reply) = run_bucket_script(current, &args);

        let value = serde_json::to_string(&next)?;
        let expires_at = Self::expiry(now, ttl_from_millis(args.window_ms));
        guard.insert(key, Slot { value, expires_at }, now);
        Ok(reply)
    }
}

/// Glob matcher for key scans: `*` matches any run, `?` matches one character.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star_p, star_t)) => {
                    p = star_p + 1;
                    t = star_t + 1;
                    backtrack = Some((star_p, star_t + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}
