//! Shared counter/bucket store interface.
//!
//! The guards and the cache never talk to a concrete backend. They consume one of two
//! typed interfaces, chosen when the component is constructed:
//!
//! - [`Store`]: plain get / set-with-TTL / delete, plus an optional key scan.
//! - [`ScriptingStore`]: a [`Store`] that can also run the token-bucket script as one
//!   indivisible server-side operation.
//!
//! Values are JSON text. [`InMemoryStore`] is the process-local reference backend; the
//! `floodgate-redis` crate provides the shared one.

use crate::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

mod memory;
pub use memory::InMemoryStore;

/// Basic key-value store shared by every process instance.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Fetch the raw value for `key`, `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write `value` under `key`, expiring after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List keys matching a glob `pattern`.
    ///
    /// Only `*` (any run) and `?` (one character) are wildcards. Every other
    /// character, `[`, `]` and `\` included, matches itself on every backend.
    ///
    /// Optional capability; stores that cannot scan return [`StoreError::Unsupported`]
    /// and report `false` from [`Store::supports_key_scan`].
    async fn keys(&self, _pattern: &str) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unsupported { op: "keys" })
    }

    /// Whether [`Store::keys`] is implemented.
    fn supports_key_scan(&self) -> bool {
        false
    }
}

/// A store that can execute the token-bucket script atomically.
#[async_trait]
pub trait ScriptingStore: Store {
    /// Refill-then-maybe-consume the bucket at `key` in one round trip.
    ///
    /// No other caller may observe or mutate the bucket while the script runs.
    async fn eval_token_bucket(
        &self,
        key: &str,
        args: BucketScriptArgs,
    ) -> Result<BucketScriptReply, StoreError>;
}

/// Inputs of the token-bucket script (`ARGV[1..=5]`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketScriptArgs {
    /// Maximum tokens in the bucket.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Bucket TTL in milliseconds.
    pub window_ms: u64,
    /// Tokens this request consumes.
    pub requested_tokens: f64,
    /// Caller's epoch milliseconds.
    pub now_ms: u64,
}

/// Output of the token-bucket script: `(allowed, tokensRemaining, capacity)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketScriptReply {
    /// Whether the requested tokens were taken.
    pub allowed: bool,
    /// Tokens left after the update.
    pub tokens_remaining: f64,
    /// Bucket capacity echoed back.
    pub capacity: f64,
}

/// Persisted bucket state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Current (fractional) token count, `0 <= tokens <= capacity`.
    pub tokens: f64,
    /// Epoch milliseconds of the last refill.
    pub last_refill: u64,
}

/// Pure bucket arithmetic shared by every backend that evaluates the script locally.
///
/// Missing state starts full. Refill is continuous (`elapsed_secs * refill_rate`), so a
/// bucket polled faster than one token per interval still accumulates. The returned
/// state is what must be persisted with a TTL of `window_ms`, allowed or not.
pub fn run_bucket_script(
    current: Option<BucketState>,
    args: &BucketScriptArgs,
) -> (BucketState, BucketScriptReply) {
    let BucketState { tokens, last_refill } =
        current.unwrap_or(BucketState { tokens: args.capacity, last_refill: args.now_ms });

    let elapsed_ms = args.now_ms.saturating_sub(last_refill);
    let refilled = tokens + (elapsed_ms as f64 / 1000.0) * args.refill_rate;
    let available = refilled.clamp(0.0, args.capacity);

    let (allowed, remaining) = if available >= args.requested_tokens {
        (true, available - args.requested_tokens)
    } else {
        (false, available)
    };

    (
        BucketState { tokens: remaining, last_refill: args.now_ms.max(last_refill) },
        BucketScriptReply { allowed, tokens_remaining: remaining, capacity: args.capacity },
    )
}

/// Round a millisecond TTL up to whole seconds, never below one.
pub(crate) fn ttl_from_millis(millis: u64) -> Duration {
    Duration::from_secs(millis.div_ceil(1000).max(1))
}
