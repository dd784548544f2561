#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Floodgate
//!
//! Admission control and cache coherency for async web services that share one
//! external store across many process instances.
//!
//! ## Features
//!
//! - **Fixed-window guard**: cheap per-client request counting with a stricter tier
//!   for sensitive paths
//! - **Token-bucket guard**: per-route policies with continuous refill, evaluated by an
//!   atomic store script when available and by get/set otherwise
//! - **Stale-while-revalidate cache** with single-flight background refresh and
//!   pattern invalidation
//! - **Fail-open everywhere**: a store outage degrades precision, never availability
//! - **Tower middleware** emitting `Retry-After` and `X-RateLimit-*` headers
//!
//! ## Quick Start
//!
//! ```rust
//! use floodgate::prelude::*;
//! use std::sync::Arc;
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryStore::new());
//!     let clock: Arc<dyn Clock> = Arc::new(SystemClock);
//!
//!     let layer = AdmissionLayer::new(PolicyTable::new().route("/auth/login", presets::auth_login()))
//!         .with_fixed_window(FixedWindowGuard::new(
//!             store.clone(),
//!             clock.clone(),
//!             FixedWindowSettings::default(),
//!         ))
//!         .with_token_bucket(TokenBucketGuard::atomic(store, clock));
//!
//!     let app = layer.layer(service_fn(|_req: http::Request<String>| async {
//!         Ok::<_, std::convert::Infallible>(http::Response::new(String::from("ok")))
//!     }));
//!
//!     let response = app
//!         .oneshot(http::Request::post("/auth/login").body(String::new())?)
//!         .await?;
//!     assert_eq!(response.status(), 200);
//!     assert_eq!(response.headers()["x-ratelimit-remaining"], "4");
//!     Ok(())
//! }
//! ```

pub mod adaptive;
pub mod cache;
pub mod clock;
pub mod error;
pub mod prelude;
pub mod rate_limit;
pub mod store;
pub mod telemetry;

// Re-exports
pub use adaptive::DynamicConfig;
pub use cache::{CacheEntry, CacheOptions, SwrCache, WarmupItem, WarmupReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{AdmissionDenied, ConfigError, DenialSource, PolicyError, StoreError};
pub use rate_limit::{
    AdmissionLayer, AdmissionService, BucketOutcome, BucketPath, Decision, FixedWindowConfig,
    FixedWindowGuard, FixedWindowSettings, PolicyTable, Quota, RateLimitPolicy, RequestDescriptor,
    TokenBucketGuard,
};
pub use store::{InMemoryStore, ScriptingStore, Store};
