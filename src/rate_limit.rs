//! Admission control.
//!
//! Two guards sit in front of the request handlers:
//! - [`FixedWindowGuard`]: cheap, coarse, applied to every request. Counts requests per
//!   client in `floor(now / window)` buckets, with a stricter tier for sensitive paths.
//! - [`TokenBucketGuard`]: precise, per-route. Each protected route carries a
//!   [`RateLimitPolicy`] in a [`PolicyTable`]; buckets refill continuously and are
//!   updated atomically when the store can run the bucket script.
//!
//! [`AdmissionLayer`] wires both into a tower stack over `http` requests. Both guards
//! share state through a [`Store`](crate::store::Store) so limits hold across
//! processes.

use crate::error::AdmissionDenied;

pub mod fixed_window;
pub mod middleware;
pub mod policy;
pub mod presets;
pub mod request;
pub mod token_bucket;

pub use fixed_window::{FixedWindowConfig, FixedWindowGuard, FixedWindowSettings};
pub use middleware::{AdmissionLayer, AdmissionService};
pub use policy::{KeyGenerator, PolicyTable, RateLimitPolicy, SkipPredicate};
pub use request::{AuthenticatedUser, MatchedRoute, RequestDescriptor};
pub use token_bucket::{BucketOutcome, BucketPath, TokenBucketGuard};

/// Remaining allowance reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Value for `X-RateLimit-Remaining`.
    pub remaining: u64,
    /// Value for `X-RateLimit-Reset` (epoch milliseconds).
    pub reset_at_ms: u64,
}

impl Quota {
    /// The more restrictive of two quotas (fewest remaining).
    pub fn tightest(a: Option<Quota>, b: Option<Quota>) -> Option<Quota> {
        match (a, b) {
            (Some(a), Some(b)) if b.remaining < a.remaining => Some(b),
            (Some(a), _) => Some(a),
            (None, b) => b,
        }
    }
}

/// The decision returned by the fixed-window guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request is allowed to proceed.
    Allowed(Quota),
    /// The path is exempt from admission control.
    Exempt,
    /// The store failed and the request was let through uncounted.
    FailOpen,
    /// The request is denied.
    Denied(AdmissionDenied),
}

impl Decision {
    /// Helper to check if allowed (exempt counts as allowed).
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Denied(_))
    }

    /// Quota to advertise, when the request was counted.
    pub fn quota(&self) -> Option<Quota> {
        match self {
            Decision::Allowed(quota) => Some(*quota),
            Decision::Exempt | Decision::FailOpen => None,
            Decision::Denied(denied) => Some(Quota { remaining: 0, reset_at_ms: denied.reset_at_ms }),
        }
    }
}
