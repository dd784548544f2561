use super::events::{BucketEvent, CacheEvent, PolicyEvent, WindowEvent};
use futures::future::{self, BoxFuture, Ready};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tower::{Service, ServiceExt};

/// A telemetry sink that consumes policy events.
///
/// Sinks are plain `tower::Service<PolicyEvent>` values so they compose with the usual
/// tower combinators and can be cloned into detached tasks.
pub trait TelemetrySink:
    Service<PolicyEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Drive `sink` to readiness and deliver `event`. Failures are logged at `debug`.
pub async fn emit_best_effort<S>(sink: S, event: PolicyEvent)
where
    S: Service<PolicyEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    if let Err(e) = sink.oneshot(event).await {
        tracing::debug!(target: "floodgate::telemetry", error = %e, "telemetry sink failed");
    }
}

/// Emit on a detached task so the caller's decision path never waits on a sink.
///
/// Must be called from within a tokio runtime.
pub fn spawn_emit<S>(sink: &S, event: PolicyEvent)
where
    S: Service<PolicyEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    tokio::spawn(emit_best_effort(sink.clone(), event));
}

type EmitFn = dyn Fn(PolicyEvent) + Send + Sync;

/// Type-erased, detached event emitter held by the guards and the cache.
///
/// Wraps any sink so components stay non-generic. Every [`emit`](Self::emit) goes
/// through [`spawn_emit`]; the default emitter drops events without spawning.
#[derive(Clone, Default)]
pub struct EventEmitter {
    emit: Option<Arc<EmitFn>>,
}

impl EventEmitter {
    /// Route events to `sink` on detached tasks.
    pub fn new<S>(sink: S) -> Self
    where
        S: Service<PolicyEvent, Response = ()> + Send + Sync + Clone + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        Self { emit: Some(Arc::new(move |event| spawn_emit(&sink, event))) }
    }

    /// Emitter that discards every event.
    pub fn null() -> Self {
        Self::default()
    }

    /// Hand `event` off without waiting for the sink.
    pub fn emit(&self, event: PolicyEvent) {
        if let Some(emit) = &self.emit {
            emit(event);
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter").field("attached", &self.emit.is_some()).finish()
    }
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl Service<PolicyEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: PolicyEvent) -> Self::Future {
        future::ok(())
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Writes events to `tracing` under the `floodgate::events` target.
///
/// Degradations (fail-open, scripting fallback, failed refreshes) log at `warn`,
/// denials at `info`, cache traffic at `debug`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl LogSink {
    fn log(event: &PolicyEvent) {
        match event {
            PolicyEvent::FixedWindow(WindowEvent::Blocked { scope }) => {
                tracing::info!(target: "floodgate::events", scope, "fixed window blocked request");
            }
            PolicyEvent::FixedWindow(WindowEvent::FailOpen { scope }) => {
                tracing::warn!(target: "floodgate::events", scope, "fixed window failed open");
            }
            PolicyEvent::TokenBucket(BucketEvent::Blocked { route }) => {
                tracing::info!(target: "floodgate::events", route = %route, "token bucket blocked request");
            }
            PolicyEvent::TokenBucket(BucketEvent::FallbackEngaged) => {
                tracing::warn!(target: "floodgate::events", "token bucket switched to get/set fallback");
            }
            PolicyEvent::TokenBucket(BucketEvent::FailOpen { route }) => {
                tracing::warn!(target: "floodgate::events", route = %route, "token bucket failed open");
            }
            PolicyEvent::Cache(CacheEvent::Hit { source, stale }) => {
                tracing::debug!(target: "floodgate::events", source = %source, stale, "cache hit");
            }
            PolicyEvent::Cache(CacheEvent::Miss { source }) => {
                tracing::debug!(target: "floodgate::events", source = %source, "cache miss");
            }
            PolicyEvent::Cache(CacheEvent::Bypass { source }) => {
                tracing::warn!(target: "floodgate::events", source = %source, "cache bypassed");
            }
            PolicyEvent::Cache(CacheEvent::RefreshFailed { source }) => {
                tracing::warn!(target: "floodgate::events", source = %source, "cache refresh failed");
            }
        }
    }
}

impl Service<PolicyEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        Self::log(&event);
        future::ok(())
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

#[derive(Debug)]
struct Ring {
    events: VecDeque<PolicyEvent>,
    capacity: usize,
    evicted: u64,
}

/// Keeps the most recent events in memory, for tests and debug endpoints.
///
/// Clones share one buffer. Once full, the oldest event is evicted per new arrival.
#[derive(Clone, Debug)]
pub struct MemorySink {
    ring: Arc<Mutex<Ring>>,
}

impl MemorySink {
    /// Buffer of 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Buffer of `capacity` events (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Arc::new(Mutex::new(Ring {
                events: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
                evicted: 0,
            })),
        }
    }

    /// Snapshot, oldest first.
    pub fn events(&self) -> Vec<PolicyEvent> {
        self.lock().events.iter().cloned().collect()
    }

    /// Number of buffered events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&PolicyEvent) -> bool) -> usize {
        self.lock().events.iter().filter(|event| predicate(event)).count()
    }

    pub fn clear(&self) {
        self.lock().events.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    /// Events pushed out by newer ones.
    pub fn evicted(&self) -> u64 {
        self.lock().evicted
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<PolicyEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        let mut ring = self.lock();
        if ring.events.len() >= ring.capacity {
            ring.events.pop_front();
            ring.evicted += 1;
        }
        ring.events.push_back(event);
        future::ok(())
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Puts a bounded queue and one worker task in front of a slow sink.
///
/// `call` never waits: when the queue is full the event is dropped and counted.
#[derive(Clone, Debug)]
pub struct NonBlockingSink {
    tx: tokio::sync::mpsc::Sender<PolicyEvent>,
    dropped: Arc<AtomicU64>,
}

impl NonBlockingSink {
    /// Queue up to `capacity` events for `sink`. Must be called within a tokio runtime.
    pub fn with_capacity<S>(sink: S, capacity: usize) -> Self
    where
        S: Service<PolicyEvent, Response = ()> + Send + Clone + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                emit_best_effort(sink.clone(), event).await;
            }
        });
        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Events lost to a full queue.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Service<PolicyEvent> for NonBlockingSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        future::ok(())
    }
}

impl TelemetrySink for NonBlockingSink {
    type SinkError = Infallible;
}

/// Error from one side of a [`MulticastSink`].
#[derive(Debug, thiserror::Error)]
#[error("telemetry sink error: {0}")]
pub struct ComposedSinkError(#[source] Box<dyn std::error::Error + Send + Sync>);

/// Delivers every event to two sinks concurrently, e.g. logs plus Prometheus.
///
/// Both sinks always receive the event; the first error is reported.
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    first: A,
    second: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A, B> Service<PolicyEvent> for MulticastSink<A, B>
where
    A: Service<PolicyEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: Service<PolicyEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = ComposedSinkError;
    type Future = BoxFuture<'static, Result<(), ComposedSinkError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        let first = self.first.clone().oneshot(event.clone());
        let second = self.second.clone().oneshot(event);
        Box::pin(async move {
            let (a, b) = future::join(first, second).await;
            a.map_err(|e| ComposedSinkError(Box::new(e)))?;
            b.map_err(|e| ComposedSinkError(Box::new(e)))
        })
    }
}

impl<A, B> TelemetrySink for MulticastSink<A, B>
where
    A: Service<PolicyEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: Service<PolicyEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type SinkError = ComposedSinkError;
}
