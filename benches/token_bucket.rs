use criterion::{black_box, criterion_group, criterion_main, Criterion};
use floodgate::prelude::*;

use http::{Request, Response};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower::{service_fn, Layer, Service};

// Large enough that the bucket never empties during a run.
fn roomy_policy() -> RateLimitPolicy {
    RateLimitPolicy::new(1e12, 1e9, Duration::from_secs(60)).unwrap()
}

fn request() -> RequestDescriptor {
    RequestDescriptor::new("GET", "/listings").with_route("/listings").with_remote_addr("10.0.0.1")
}

fn token_bucket_atomic(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let guard = TokenBucketGuard::atomic(Arc::new(InMemoryStore::new()), Arc::new(SystemClock));
    let policy = roomy_policy();
    let req = request();

    c.bench_function("token_bucket_atomic_check", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(guard.check(black_box(&policy), black_box(&req)).await);
        });
    });
}

fn token_bucket_fallback(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let guard = TokenBucketGuard::basic(Arc::new(InMemoryStore::new()), Arc::new(SystemClock));
    let policy = roomy_policy();
    let req = request();

    c.bench_function("token_bucket_fallback_check", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(guard.check(black_box(&policy), black_box(&req)).await);
        });
    });
}

fn admission_middleware(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let settings = FixedWindowSettings {
        default_tier: FixedWindowConfig::new(u64::MAX, Duration::from_secs(60)).unwrap(),
        ..FixedWindowSettings::default()
    };
    let layer = AdmissionLayer::new(PolicyTable::new().class("/listings", roomy_policy()))
        .with_fixed_window(FixedWindowGuard::new(store.clone(), clock.clone(), settings))
        .with_token_bucket(TokenBucketGuard::atomic(store, clock));
    let svc = layer.layer(service_fn(|_req: Request<String>| async {
        Ok::<_, Infallible>(Response::new(String::new()))
    }));

    c.bench_function("admission_middleware_allowed", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let req = Request::get("/listings").body(String::new()).unwrap();
            let _ = black_box(local_svc.call(black_box(req))).await;
        });
    });
}

criterion_group!(benches, token_bucket_atomic, token_bucket_fallback, admission_middleware);
criterion_main!(benches);
