//! Prometheus counters for `floodgate` events.
//! Bring your own `prometheus::Registry`; counters are registered and incremented.
//!
//! | counter | labels |
//! |---|---|
//! | `rate_limit_block_total` | `route` |
//! | `fixed_window_block_total` | `scope` |
//! | `cache_hit_total` | `source`, `freshness` |
//! | `cache_miss_total` | `source` |
//! | `store_fallback_total` | `component` |

use floodgate::telemetry::{BucketEvent, CacheEvent, PolicyEvent, TelemetrySink, WindowEvent};
use prometheus::{IntCounterVec, Opts, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
struct Counters {
    rate_limit_block: IntCounterVec,
    fixed_window_block: IntCounterVec,
    cache_hit: IntCounterVec,
    cache_miss: IntCounterVec,
    store_fallback: IntCounterVec,
}

impl Counters {
    fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let counter = |name: &str, help: &str, labels: &[&str]| -> Result<IntCounterVec, prometheus::Error> {
            let vec = IntCounterVec::new(Opts::new(name, help), labels)?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        Ok(Self {
            rate_limit_block: counter(
                "rate_limit_block_total",
                "Requests denied by a token-bucket policy",
                &["route"],
            )?,
            fixed_window_block: counter(
                "fixed_window_block_total",
                "Requests denied by the fixed-window guard",
                &["scope"],
            )?,
            cache_hit: counter("cache_hit_total", "Reads served from cache", &["source", "freshness"])?,
            cache_miss: counter("cache_miss_total", "Reads that fetched inline", &["source"])?,
            store_fallback: counter(
                "store_fallback_total",
                "Store failures absorbed by failing open, bypassing or degrading",
                &["component"],
            )?,
        })
    }
}

/// Telemetry sink that turns policy events into Prometheus counters.
#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    counters: Counters,
}

impl PrometheusSink {
    /// Create a sink and register counters into the provided registry.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let counters = Counters::register(&registry)?;
        Ok(Self { registry, counters })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn record(&self, event: &PolicyEvent) {
        let c = &self.counters;
        match event {
            PolicyEvent::TokenBucket(BucketEvent::Blocked { route }) => {
                c.rate_limit_block.with_label_values(&[route.as_str()]).inc()
            }
            PolicyEvent::TokenBucket(BucketEvent::FallbackEngaged) => {
                c.store_fallback.with_label_values(&["token_bucket_script"]).inc()
            }
            PolicyEvent::TokenBucket(BucketEvent::FailOpen { .. }) => {
                c.store_fallback.with_label_values(&["token_bucket"]).inc()
            }
            PolicyEvent::FixedWindow(WindowEvent::Blocked { scope }) => {
                c.fixed_window_block.with_label_values(&[*scope]).inc()
            }
            PolicyEvent::FixedWindow(WindowEvent::FailOpen { .. }) => {
                c.store_fallback.with_label_values(&["fixed_window"]).inc()
            }
            PolicyEvent::Cache(CacheEvent::Hit { source, stale }) => {
                let freshness = if *stale { "stale" } else { "fresh" };
                c.cache_hit.with_label_values(&[source.as_str(), freshness]).inc()
            }
            PolicyEvent::Cache(CacheEvent::Miss { source }) => {
                c.cache_miss.with_label_values(&[source.as_str()]).inc()
            }
            PolicyEvent::Cache(CacheEvent::Bypass { .. }) => {
                c.store_fallback.with_label_values(&["cache_read"]).inc()
            }
            PolicyEvent::Cache(CacheEvent::RefreshFailed { source }) => {
                tracing::debug!(source = %source, "cache refresh failure observed");
                c.store_fallback.with_label_values(&["cache_refresh"]).inc()
            }
        }
    }
}

impl tower_service::Service<PolicyEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        self.record(&event);
        ready(Ok(()))
    }
}

impl TelemetrySink for PrometheusSink {
    type SinkError = Infallible;
}
