//! Per-route token buckets over a shared store.
//!
//! A guard is built for one of two store capabilities:
//! - [`TokenBucketGuard::atomic`]: the refill-then-consume step runs as one script on
//!   the store, so concurrent callers on the same bucket are serialized by the store.
//! - [`TokenBucketGuard::basic`]: the same arithmetic over separate get/set calls. Two
//!   callers can read the same token count before either writes back, so enforcement
//!   is looser under contention. There is deliberately no retry loop or lock here.
//!
//! An atomic guard whose store reports scripting as unsupported switches to the basic
//! path for the rest of the process lifetime.

use super::policy::RateLimitPolicy;
use super::request::RequestDescriptor;
use super::Quota;
use crate::clock::Clock;
use crate::error::{AdmissionDenied, DenialSource, StoreError};
use crate::store::{
    run_bucket_script, ttl_from_millis, BucketScriptArgs, BucketScriptReply, BucketState,
    ScriptingStore, Store,
};
use crate::telemetry::{BucketEvent, EventEmitter, PolicyEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a bucket check was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketPath {
    /// Evaluated by the store's atomic script.
    Atomic,
    /// Evaluated client-side with get/set.
    Fallback,
    /// The policy's skip predicate matched; no bucket was touched.
    Skipped,
    /// The store failed and the request was let through.
    FailOpen,
}

/// Result of an admitted bucket check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    /// Whole tokens left after this request.
    pub remaining: u64,
    /// Bucket capacity.
    pub capacity: f64,
    /// Epoch milliseconds at which at least one token will be available.
    pub reset_at_ms: u64,
    /// Which path produced the decision.
    pub path: BucketPath,
}

impl BucketOutcome {
    fn unchecked(path: BucketPath, policy: &RateLimitPolicy, now: u64) -> Self {
        Self { remaining: policy.capacity().floor() as u64, capacity: policy.capacity(), reset_at_ms: now, path }
    }

    /// Quota to advertise, when the bucket was actually consulted.
    pub fn quota(&self) -> Option<Quota> {
        match self.path {
            BucketPath::Atomic | BucketPath::Fallback => {
                Some(Quota { remaining: self.remaining, reset_at_ms: self.reset_at_ms })
            }
            BucketPath::Skipped | BucketPath::FailOpen => None,
        }
    }
}

/// Milliseconds until `tokens` reaches one whole token at `refill_rate` tokens/s.
fn millis_until_token(tokens: f64, refill_rate: f64) -> u64 {
    let missing = (1.0 - tokens).max(0.0);
    (missing / refill_rate * 1000.0).ceil() as u64
}

/// Token-bucket admission guard.
///
/// Cheap to clone; clones share the scripting-disabled flag.
#[derive(Debug, Clone)]
pub struct TokenBucketGuard {
    scripting: Option<Arc<dyn ScriptingStore>>,
    store: Arc<dyn Store>,
    scripting_disabled: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
    emitter: EventEmitter,
}

impl TokenBucketGuard {
    /// Guard that prefers the store's atomic bucket script.
    pub fn atomic<S>(store: Arc<S>, clock: Arc<dyn Clock>) -> Self
    where
        S: ScriptingStore + 'static,
    {
        let scripting: Arc<dyn ScriptingStore> = store.clone();
        let basic: Arc<dyn Store> = store;
        Self {
            scripting: Some(scripting),
            store: basic,
            scripting_disabled: Arc::new(AtomicBool::new(false)),
            clock,
            emitter: EventEmitter::null(),
        }
    }

    /// Guard over a store without scripting; always uses get/set.
    pub fn basic(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            scripting: None,
            store,
            scripting_disabled: Arc::new(AtomicBool::new(true)),
            clock,
            emitter: EventEmitter::null(),
        }
    }

    /// Send block, fallback and fail-open events to `emitter`.
    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// True while checks go through the atomic script.
    pub fn is_atomic(&self) -> bool {
        self.scripting.is_some() && !self.scripting_disabled.load(Ordering::Acquire)
    }

    /// Take one token for `req` under `policy`.
    ///
    /// Store failures never deny: they are logged and the request is admitted with
    /// [`BucketPath::FailOpen`].
    pub async fn check(
        &self,
        policy: &RateLimitPolicy,
        req: &RequestDescriptor,
    ) -> Result<BucketOutcome, AdmissionDenied> {
        let now = self.clock.now_millis();
        if policy.should_skip(req) {
            return Ok(BucketOutcome::unchecked(BucketPath::Skipped, policy, now));
        }

        let key = policy.bucket_key(req);
        let args = BucketScriptArgs {
            capacity: policy.capacity(),
            refill_rate: policy.refill_rate(),
            window_ms: policy.window_ms(),
            requested_tokens: 1.0,
            now_ms: now,
        };

        let (path, reply) = match self.evaluate(&key, args).await {
            Ok(evaluated) => evaluated,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "token bucket store failed; allowing request");
                self.emitter.emit(PolicyEvent::TokenBucket(BucketEvent::FailOpen {
                    route: req.route_or_path().to_string(),
                }));
                return Ok(BucketOutcome::unchecked(BucketPath::FailOpen, policy, now));
            }
        };

        let wait_ms = millis_until_token(reply.tokens_remaining, policy.refill_rate());
        let reset_at_ms = now.saturating_add(wait_ms);

        if reply.allowed {
            return Ok(BucketOutcome {
                remaining: reply.tokens_remaining.max(0.0).floor() as u64,
                capacity: reply.capacity,
                reset_at_ms,
                path,
            });
        }

        tracing::debug!(key = %key, tokens = reply.tokens_remaining, "token bucket empty");
        self.emitter.emit(PolicyEvent::TokenBucket(BucketEvent::Blocked {
            route: req.route.clone().unwrap_or_else(|| "unknown".to_string()),
        }));
        Err(AdmissionDenied::new(
            policy.message(),
            Duration::from_millis(wait_ms),
            reset_at_ms,
            DenialSource::TokenBucket,
        ))
    }

    async fn evaluate(
        &self,
        key: &str,
        args: BucketScriptArgs,
    ) -> Result<(BucketPath, BucketScriptReply), StoreError> {
        if let Some(scripting) = &self.scripting {
            if !self.scripting_disabled.load(Ordering::Acquire) {
                match scripting.eval_token_bucket(key, args).await {
                    Err(e) if e.is_script_unsupported() => self.disable_scripting(&e),
                    other => return other.map(|reply| (BucketPath::Atomic, reply)),
                }
            }
        }
        self.fallback(key, args).await.map(|reply| (BucketPath::Fallback, reply))
    }

    fn disable_scripting(&self, cause: &StoreError) {
        if !self.scripting_disabled.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                error = %cause,
                "store rejected the token bucket script; using get/set fallback for this process"
            );
            self.emitter.emit(PolicyEvent::TokenBucket(BucketEvent::FallbackEngaged));
        }
    }

    async fn fallback(&self, key: &str, args: BucketScriptArgs) -> Result<BucketScriptReply, StoreError> {
        let bucket_key = format!("{key}:bucket");
        let current = match self.store.get(&bucket_key).await? {
            Some(raw) => match serde_json::from_str::<BucketState>(&raw) {
                Ok(state) => Some(state),
                Err(e) => {
                    tracing::warn!(key = %bucket_key, error = %e, "discarding unreadable bucket state");
                    None
                }
            },
            None => None,
        };

        let (next, reply) = run_bucket_script(current, &args);
        let value = serde_json::to_string(&next)?;
        self.store.set(&bucket_key, value, ttl_from_millis(args.window_ms)).await?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;

    fn policy() -> RateLimitPolicy {
        RateLimitPolicy::new(5.0, 1.0, Duration::from_secs(60)).unwrap()
    }

    fn login() -> RequestDescriptor {
        RequestDescriptor::new("POST", "/auth/login").with_route("/auth/login").with_remote_addr("1.2.3.4")
    }

    /// In-memory store whose scripting endpoint is disabled.
    #[derive(Debug, Default)]
    struct NoScripting {
        inner: InMemoryStore,
    }

    #[async_trait]
    impl Store for NoScripting {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }
    }

    #[async_trait]
    impl ScriptingStore for NoScripting {
        async fn eval_token_bucket(
            &self,
            _key: &str,
            _args: BucketScriptArgs,
        ) -> Result<BucketScriptReply, StoreError> {
            Err(StoreError::ScriptUnsupported("NOSCRIPT scripting is disabled".into()))
        }
    }

    #[tokio::test]
    async fn atomic_path_allows_capacity_then_denies() {
        let clock = ManualClock::new(1_000_000);
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        let guard = TokenBucketGuard::atomic(store, Arc::new(clock.clone()));

        for expected in (0..5).rev() {
            let outcome = guard.check(&policy(), &login()).await.unwrap();
            assert_eq!(outcome.path, BucketPath::Atomic);
            assert_eq!(outcome.remaining, expected);
        }

        let denied = guard.check(&policy(), &login()).await.unwrap_err();
        assert_eq!(denied.message, "Rate limit exceeded");
        assert_eq!(denied.retry_after_secs(), 1);
        assert_eq!(denied.reset_at_ms, 1_001_000);

        clock.advance(1_000);
        assert!(guard.check(&policy(), &login()).await.is_ok());
        assert!(guard.check(&policy(), &login()).await.is_err());
    }

    #[tokio::test]
    async fn unsupported_scripting_switches_to_fallback_once() {
        let clock = ManualClock::new(0);
        let store = Arc::new(NoScripting::default());
        let guard = TokenBucketGuard::atomic(store.clone(), Arc::new(clock));
        assert!(guard.is_atomic());

        let outcome = guard.check(&policy(), &login()).await.unwrap();
        assert_eq!(outcome.path, BucketPath::Fallback);
        assert_eq!(outcome.remaining, 4);
        assert!(!guard.is_atomic());

        let raw = store.inner.get("rate_limit:1.2.3.4:/auth/login:bucket").await.unwrap().unwrap();
        let state: BucketState = serde_json::from_str(&raw).unwrap();
        assert_eq!(state.tokens, 4.0);

        let outcome = guard.check(&policy(), &login()).await.unwrap();
        assert_eq!(outcome.path, BucketPath::Fallback);
        assert_eq!(outcome.remaining, 3);
    }

    #[tokio::test]
    async fn skip_predicate_bypasses_the_store() {
        let clock = ManualClock::new(0);
        let store = InMemoryStore::with_clock(Arc::new(clock.clone()));
        let guard = TokenBucketGuard::basic(Arc::new(store.clone()), Arc::new(clock));
        let internal = policy().skip_when(|req| req.real_ip.as_deref() == Some("127.0.0.1"));

        let outcome = guard.check(&internal, &login().with_real_ip("127.0.0.1")).await.unwrap();
        assert_eq!(outcome.path, BucketPath::Skipped);
        assert_eq!(outcome.quota(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn unreadable_fallback_state_starts_full() {
        let clock = ManualClock::new(0);
        let store = InMemoryStore::with_clock(Arc::new(clock.clone()));
        store
            .set("rate_limit:1.2.3.4:/auth/login:bucket", "not json".into(), Duration::from_secs(60))
            .await
            .unwrap();
        let guard = TokenBucketGuard::basic(Arc::new(store), Arc::new(clock));

        let outcome = guard.check(&policy(), &login()).await.unwrap();
        assert_eq!(outcome.path, BucketPath::Fallback);
        assert_eq!(outcome.remaining, 4);
    }

    #[test]
    fn reset_time_is_time_to_one_token() {
        assert_eq!(millis_until_token(0.0, 1.0), 1_000);
        assert_eq!(millis_until_token(0.5, 0.5), 1_000);
        assert_eq!(millis_until_token(3.0, 1.0), 0);
    }
}
