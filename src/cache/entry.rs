use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cached value plus the instants that govern how it may be served.
///
/// `timestamp <= stale_at <= expires_at` for every entry written by this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// The cached payload.
    pub data: T,
    /// Epoch milliseconds at which the payload was fetched.
    pub timestamp: u64,
    /// After this instant the entry is served stale and refreshed in the background.
    pub stale_at: u64,
    /// At and after this instant the entry is treated as absent.
    pub expires_at: u64,
    /// Namespace generation the entry was written under.
    pub version: u64,
}

/// How fresh an entry is at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Serve as-is.
    Fresh,
    /// Serve as-is, but the warm-up window has opened: refresh in the background.
    Warming,
    /// Serve stale and refresh in the background.
    Stale,
    /// Do not serve; recompute.
    Expired,
}

impl<T> CacheEntry<T> {
    /// Entry for `data` fetched at `now`.
    pub fn new(data: T, now: u64, options: &CacheOptions, version: u64) -> Self {
        Self {
            data,
            timestamp: now,
            stale_at: now.saturating_add(options.stale_ttl_ms()),
            expires_at: now.saturating_add(options.ttl_ms()),
            version,
        }
    }

    /// Classify the entry at `now`.
    pub fn freshness(&self, now: u64, warmup_threshold: Duration) -> Freshness {
        let threshold = u64::try_from(warmup_threshold.as_millis()).unwrap_or(u64::MAX);
        if now >= self.expires_at {
            Freshness::Expired
        } else if now >= self.stale_at {
            Freshness::Stale
        } else if threshold > 0 && now >= self.stale_at.saturating_sub(threshold) {
            Freshness::Warming
        } else {
            Freshness::Fresh
        }
    }
}

/// Lifetimes applied to entries written by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    ttl: Duration,
    stale_ttl: Duration,
    warmup_threshold: Duration,
}

impl Default for CacheOptions {
    /// Five minutes total, fresh for two, no early warm-up.
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            stale_ttl: Duration::from_secs(2 * 60),
            warmup_threshold: Duration::ZERO,
        }
    }
}

impl CacheOptions {
    /// Entries expire after `ttl` and turn stale after `stale_ttl`.
    pub fn new(ttl: Duration, stale_ttl: Duration) -> Result<Self, ConfigError> {
        if ttl < Duration::from_millis(1) {
            return Err(ConfigError::DurationOutOfRange { field: "ttl", provided: ttl });
        }
        if stale_ttl > ttl {
            return Err(ConfigError::DurationOutOfRange { field: "stale_ttl", provided: stale_ttl });
        }
        Ok(Self { ttl, stale_ttl, warmup_threshold: Duration::ZERO })
    }

    /// Start refreshing `threshold` before an entry turns stale. Zero disables it.
    pub fn with_warmup_threshold(mut self, threshold: Duration) -> Self {
        self.warmup_threshold = threshold.min(self.stale_ttl);
        self
    }

    /// Total entry lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh lifetime.
    pub fn stale_ttl(&self) -> Duration {
        self.stale_ttl
    }

    /// Early refresh window before `stale_at`.
    pub fn warmup_threshold(&self) -> Duration {
        self.warmup_threshold
    }

    fn ttl_ms(&self) -> u64 {
        u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX)
    }

    fn stale_ttl_ms(&self) -> u64 {
        u64::try_from(self.stale_ttl.as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: u64 = 60_000;

    #[test]
    fn freshness_follows_the_three_instants() {
        let entry = CacheEntry::new("rows", 0, &CacheOptions::default(), 0);
        assert_eq!(entry.stale_at, 2 * MINUTE);
        assert_eq!(entry.expires_at, 5 * MINUTE);

        let none = Duration::ZERO;
        assert_eq!(entry.freshness(2 * MINUTE - 1, none), Freshness::Fresh);
        assert_eq!(entry.freshness(2 * MINUTE, none), Freshness::Stale);
        assert_eq!(entry.freshness(5 * MINUTE - 1, none), Freshness::Stale);
        assert_eq!(entry.freshness(5 * MINUTE, none), Freshness::Expired);
    }

    #[test]
    fn warmup_window_precedes_stale() {
        let entry = CacheEntry::new((), 0, &CacheOptions::default(), 0);
        let threshold = Duration::from_secs(30);
        assert_eq!(entry.freshness(90_000 - 1, threshold), Freshness::Fresh);
        assert_eq!(entry.freshness(90_000, threshold), Freshness::Warming);
        assert_eq!(entry.freshness(2 * MINUTE, threshold), Freshness::Stale);
    }

    #[test]
    fn options_validate_ordering() {
        assert!(CacheOptions::new(Duration::from_secs(60), Duration::from_secs(61)).is_err());
        assert!(CacheOptions::new(Duration::ZERO, Duration::ZERO).is_err());

        let options = CacheOptions::new(Duration::from_secs(60), Duration::from_secs(20))
            .unwrap()
            .with_warmup_threshold(Duration::from_secs(90));
        assert_eq!(options.warmup_threshold(), Duration::from_secs(20));
    }

    #[test]
    fn entry_round_trips_through_json() {
        let entry = CacheEntry::new(vec![1, 2, 3], 10, &CacheOptions::default(), 4);
        let raw = serde_json::to_string(&entry).unwrap();
        assert!(raw.contains("\"stale_at\":120010"));
        let back: CacheEntry<Vec<i32>> = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, entry);
    }
}
