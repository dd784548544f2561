//! Telemetry for the admission guards and the cache.
//!
//! Guards and the cache emit structured [`PolicyEvent`]s (blocks, fail-open decisions,
//! cache hits/misses, refresh failures). Events flow through [`TelemetrySink`]
//! implementations which can log, aggregate, or forward them to external systems
//! (see the `floodgate-prometheus` crate for counters).
//!
//! Emission is fire-and-forget: [`spawn_emit`] hands the event to a detached task, so a
//! sink error or stall is structurally unable to affect an admission decision.

pub mod events;
pub mod sinks;

pub use events::{BucketEvent, CacheEvent, PolicyEvent, WindowEvent};
pub use sinks::{
    emit_best_effort, spawn_emit, ComposedSinkError, EventEmitter, LogSink, MemorySink, MulticastSink,
    NonBlockingSink, NullSink, TelemetrySink,
};
