//! Error types for the admission guards, the store and configuration.
use std::time::Duration;

/// Failures talking to the shared counter/bucket store.
///
/// None of these ever reach an end user: the guards fail open and the cache bypasses
/// to a direct fetch. They exist so the caller can log and count them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or returned a transport error.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store did not answer within the configured operation timeout.
    #[error("store operation `{op}` timed out after {after:?}")]
    Timeout {
        /// Operation that timed out (`get`, `set`, `eval`, ...).
        op: &'static str,
        /// Configured limit that was exceeded.
        after: Duration,
    },
    /// The store refuses to run server-side scripts (e.g. scripting disabled).
    #[error("atomic scripting unsupported: {0}")]
    ScriptUnsupported(String),
    /// The store does not implement an optional capability such as key scans.
    #[error("store does not support `{op}`")]
    Unsupported {
        /// Name of the missing capability.
        op: &'static str,
    },
    /// A stored value could not be encoded or decoded.
    #[error("store value codec error: {0}")]
    Codec(String),
}

impl StoreError {
    /// Check if this error is due to an operation timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error means scripting is permanently unavailable.
    pub fn is_script_unsupported(&self) -> bool {
        matches!(self, Self::ScriptUnsupported(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

/// Which guard produced a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialSource {
    /// The coarse, broadly applied fixed-window guard.
    FixedWindow,
    /// The per-route token-bucket guard.
    TokenBucket,
}

/// An expected, user-facing admission denial (HTTP 429).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct AdmissionDenied {
    /// Message shown to the client.
    pub message: String,
    /// How long the client should wait; always at least one second.
    pub retry_after: Duration,
    /// Epoch milliseconds at which capacity is next available.
    pub reset_at_ms: u64,
    /// Guard that denied the request.
    pub denied_by: DenialSource,
}

impl AdmissionDenied {
    /// Build a denial, clamping `retry_after` to the one-second floor of `Retry-After`.
    pub fn new(
        message: impl Into<String>,
        retry_after: Duration,
        reset_at_ms: u64,
        denied_by: DenialSource,
    ) -> Self {
        Self {
            message: message.into(),
            retry_after: retry_after.max(Duration::from_secs(1)),
            reset_at_ms,
            denied_by,
        }
    }

    /// Value for the `Retry-After` header, in whole seconds (rounded up, >= 1).
    pub fn retry_after_secs(&self) -> u64 {
        let millis = u64::try_from(self.retry_after.as_millis()).unwrap_or(u64::MAX);
        millis.div_ceil(1000).max(1)
    }
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held something unparsable.
    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// Raw value found.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
    /// A limit must be strictly positive.
    #[error("{field} must be > 0 (got {provided})")]
    NonPositive {
        /// Field that was rejected.
        field: &'static str,
        /// Value provided by caller.
        provided: f64,
    },
    /// A duration fell outside its allowed range.
    #[error("{field} out of range: {provided:?}")]
    DurationOutOfRange {
        /// Field that was rejected.
        field: &'static str,
        /// Value provided by caller.
        provided: Duration,
    },
}

/// A rate-limit policy that cannot be enforced.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    /// Bucket capacity must be > 0.
    #[error("capacity must be > 0 (got {provided})")]
    InvalidCapacity {
        /// Value provided by caller.
        provided: f64,
    },
    /// Refill rate must be > 0 tokens per second.
    #[error("refill_rate must be > 0 (got {provided})")]
    InvalidRefillRate {
        /// Value provided by caller.
        provided: f64,
    },
    /// The bucket TTL must be at least one millisecond.
    #[error("window must be > 0 (got {0:?})")]
    InvalidWindow(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_rounds_up_and_floors_at_one() {
        let denied = AdmissionDenied::new("slow down", Duration::from_millis(1_200), 0, DenialSource::FixedWindow);
        assert_eq!(denied.retry_after_secs(), 2);

        let denied = AdmissionDenied::new("slow down", Duration::ZERO, 0, DenialSource::TokenBucket);
        assert_eq!(denied.retry_after_secs(), 1);
    }

    #[test]
    fn store_error_display() {
        let err = StoreError::Timeout { op: "eval", after: Duration::from_millis(250) };
        let msg = err.to_string();
        assert!(msg.contains("eval"));
        assert!(msg.contains("250"));
        assert!(err.is_timeout());
        assert!(!err.is_script_unsupported());
    }

    #[test]
    fn denial_displays_configured_message() {
        let denied = AdmissionDenied::new(
            "Too many login attempts. Please try again later.",
            Duration::from_secs(3),
            42,
            DenialSource::TokenBucket,
        );
        assert_eq!(denied.to_string(), "Too many login attempts. Please try again later.");
    }

    #[test]
    fn denial_is_a_leaf_error_tagged_with_its_guard() {
        use std::error::Error as _;
        let denied = AdmissionDenied::new("Too Many Requests", Duration::from_secs(60), 0, DenialSource::FixedWindow);
        assert_eq!(denied.denied_by, DenialSource::FixedWindow);
        assert!(denied.source().is_none());
    }

    #[test]
    fn policy_error_display() {
        let err = PolicyError::InvalidRefillRate { provided: 0.0 };
        assert_eq!(err.to_string(), "refill_rate must be > 0 (got 0)");
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::InvalidEnv {
            name: "RATE_LIMIT_MAX",
            value: "lots".into(),
            reason: "invalid digit found in string".into(),
        };
        assert!(err.to_string().contains("RATE_LIMIT_MAX"));
    }
}
