mod common;

use async_trait::async_trait;
use common::test_helpers::{self, FailingStore, T0};
use floodgate::prelude::*;
use floodgate::rate_limit::BucketPath;
use floodgate::store::{BucketScriptArgs, BucketScriptReply};
use floodgate::telemetry::BucketEvent;
use std::sync::Arc;
use std::time::Duration;

fn five_per_minute() -> RateLimitPolicy {
    RateLimitPolicy::new(5.0, 1.0, Duration::from_millis(60_000)).expect("valid policy")
}

fn client(ip: &str) -> RequestDescriptor {
    RequestDescriptor::new("POST", "/auth/login").with_route("/auth/login").with_remote_addr(ip)
}

#[tokio::test]
async fn burst_then_deny_then_refill() {
    let (store, clock) = test_helpers::store_at(T0);
    let guard = TokenBucketGuard::atomic(Arc::new(store), Arc::new(clock.clone()));
    let policy = five_per_minute();
    let req = client("1.2.3.4");

    for expected in [4, 3, 2, 1, 0] {
        let outcome = guard.check(&policy, &req).await.expect("within burst");
        assert_eq!(outcome.remaining, expected);
        assert_eq!(outcome.path, BucketPath::Atomic);
    }

    let denied = guard.check(&policy, &req).await.unwrap_err();
    assert_eq!(denied.retry_after_secs(), 1);
    assert_eq!(denied.reset_at_ms, T0 + 1_000);
    assert_eq!(denied.message, "Rate limit exceeded");

    clock.advance(1_000);
    let outcome = guard.check(&policy, &req).await.expect("one token refilled");
    assert_eq!(outcome.remaining, 0);
    assert!(guard.check(&policy, &req).await.is_err(), "only one token came back");
}

#[tokio::test]
async fn buckets_are_per_client_and_route() {
    let (store, clock) = test_helpers::store_at(T0);
    let guard = TokenBucketGuard::atomic(Arc::new(store), Arc::new(clock));
    let policy = five_per_minute();

    for _ in 0..5 {
        guard.check(&policy, &client("1.2.3.4")).await.unwrap();
    }
    assert!(guard.check(&policy, &client("1.2.3.4")).await.is_err());
    assert!(guard.check(&policy, &client("5.6.7.8")).await.is_ok());

    let search = RequestDescriptor::new("GET", "/listings/search")
        .with_route("/listings/search")
        .with_remote_addr("1.2.3.4");
    assert!(guard.check(&policy, &search).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn atomic_path_never_over_admits() {
    let (store, clock) = test_helpers::store_at(T0);
    let guard = TokenBucketGuard::atomic(Arc::new(store), Arc::new(clock));
    let policy = Arc::new(five_per_minute());

    let attempts = (0..50).map(|_| {
        let guard = guard.clone();
        let policy = policy.clone();
        tokio::spawn(async move { guard.check(&policy, &client("9.9.9.9")).await.is_ok() })
    });
    let admitted = futures::future::join_all(attempts)
        .await
        .into_iter()
        .filter(|joined| matches!(joined, Ok(true)))
        .count();

    assert_eq!(admitted, 5);
}

#[derive(Debug)]
struct ScriptingDisabled(InMemoryStore);

#[async_trait]
impl Store for ScriptingDisabled {
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

#[async_trait]
impl ScriptingStore for ScriptingDisabled {
    async fn eval_token_bucket(
        &self,
        _key: &str,
        _args: BucketScriptArgs,
    ) -> Result<BucketScriptReply, StoreError> {
        Err(StoreError::ScriptUnsupported("ERR unknown command 'EVALSHA'".into()))
    }
}

#[tokio::test]
async fn fallback_engages_once_and_keeps_enforcing() {
    let (store, clock) = test_helpers::store_at(T0);
    let sink = MemorySink::new();
    let guard = TokenBucketGuard::atomic(Arc::new(ScriptingDisabled(store.clone())), Arc::new(clock))
        .with_emitter(EventEmitter::new(sink.clone()));
    let policy = five_per_minute();
    let req = client("1.2.3.4");

    for _ in 0..5 {
        let outcome = guard.check(&policy, &req).await.expect("within burst");
        assert_eq!(outcome.path, BucketPath::Fallback);
    }
    assert!(guard.check(&policy, &req).await.is_err());
    assert!(!guard.is_atomic());
    assert!(store.get("rate_limit:1.2.3.4:/auth/login:bucket").await.unwrap().is_some());

    test_helpers::drain_events().await;
    let engaged = sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, PolicyEvent::TokenBucket(BucketEvent::FallbackEngaged)))
        .count();
    assert_eq!(engaged, 1);
}

#[tokio::test]
async fn store_outage_fails_open() {
    let store = FailingStore::down();
    let sink = MemorySink::new();
    let guard = TokenBucketGuard::atomic(Arc::new(store.clone()), Arc::new(ManualClock::new(T0)))
        .with_emitter(EventEmitter::new(sink.clone()));
    let policy = five_per_minute();

    for _ in 0..10 {
        let outcome = guard.check(&policy, &client("1.2.3.4")).await.expect("fail open");
        assert_eq!(outcome.path, BucketPath::FailOpen);
        assert_eq!(outcome.quota(), None);
    }
    assert!(guard.is_atomic(), "transport errors must not disable scripting");

    test_helpers::drain_events().await;
    assert!(sink.events().contains(&PolicyEvent::TokenBucket(BucketEvent::FailOpen {
        route: "/auth/login".into()
    })));
}

#[tokio::test]
async fn presets_protect_their_routes() {
    let (store, clock) = test_helpers::store_at(T0);
    let guard = TokenBucketGuard::atomic(Arc::new(store), Arc::new(clock));
    let table = PolicyTable::new()
        .route("/auth/register", presets::auth_register())
        .class("/uploads", presets::api_upload());

    let register = RequestDescriptor::new("POST", "/auth/register").with_remote_addr("4.4.4.4");
    let policy = table.resolve(register.route_or_path()).expect("register is protected");
    for _ in 0..3 {
        guard.check(policy, &register).await.unwrap();
    }
    let denied = guard.check(policy, &register).await.unwrap_err();
    assert_eq!(denied.message, "Registration rate limit exceeded. Please try again later.");
    assert_eq!(denied.retry_after_secs(), 2);

    assert!(table.resolve("/uploads/images").is_some());
    assert!(table.resolve("/listings").is_none());
}
