//! Convenient re-exports for common Floodgate types.
pub use crate::{
    adaptive::DynamicConfig,
    cache::{CacheOptions, SwrCache, WarmupItem},
    clock::{Clock, ManualClock, SystemClock},
    error::{AdmissionDenied, ConfigError, PolicyError, StoreError},
    rate_limit::{
        presets, AdmissionLayer, AuthenticatedUser, Decision, FixedWindowConfig, FixedWindowGuard,
        FixedWindowSettings, MatchedRoute, PolicyTable, RateLimitPolicy, RequestDescriptor,
        TokenBucketGuard,
    },
    store::{InMemoryStore, ScriptingStore, Store},
    telemetry::{EventEmitter, LogSink, MemorySink, PolicyEvent},
};
