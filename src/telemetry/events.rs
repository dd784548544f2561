use std::fmt;

/// Events emitted by the guards and the cache.
///
/// Emission is always best-effort and detached from the decision path: a slow or
/// failing sink can drop events but can never delay or change an admission decision
/// or a cache read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEvent {
    /// Fixed-window guard events
    FixedWindow(WindowEvent),
    /// Token-bucket guard events
    TokenBucket(BucketEvent),
    /// Stale-while-revalidate cache events
    Cache(CacheEvent),
}

/// Events emitted by the fixed-window guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowEvent {
    /// A request was denied because its window counter reached the tier maximum.
    Blocked {
        /// Counter scope (`global` or `sensitive`)
        scope: &'static str,
    },
    /// The counter store failed and the request was let through.
    FailOpen {
        /// Counter scope (`global` or `sensitive`)
        scope: &'static str,
    },
}

/// Events emitted by the token-bucket guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketEvent {
    /// A request was denied because its bucket was empty.
    Blocked {
        /// Route template of the protected endpoint
        route: String,
    },
    /// The store rejected scripting; this process now uses the get/set path for good.
    FallbackEngaged,
    /// The store failed and the request was let through.
    FailOpen {
        /// Route template of the protected endpoint
        route: String,
    },
}

/// Events emitted by the stale-while-revalidate cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// Served from cache.
    Hit {
        /// Cache namespace
        source: String,
        /// True when the entry was past `stale_at` and a refresh was scheduled
        stale: bool,
    },
    /// Absent or expired; fetched synchronously.
    Miss {
        /// Cache namespace
        source: String,
    },
    /// The store read failed; the fetch ran uncached.
    Bypass {
        /// Cache namespace
        source: String,
    },
    /// A background refresh failed; the previous entry stays in place.
    RefreshFailed {
        /// Cache namespace
        source: String,
    },
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::FixedWindow(event) => write!(f, "FixedWindow::{}", event),
            PolicyEvent::TokenBucket(event) => write!(f, "TokenBucket::{}", event),
            PolicyEvent::Cache(event) => write!(f, "Cache::{}", event),
        }
    }
}

impl fmt::Display for WindowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowEvent::Blocked { scope } => write!(f, "Blocked(scope={})", scope),
            WindowEvent::FailOpen { scope } => write!(f, "FailOpen(scope={})", scope),
        }
    }
}

impl fmt::Display for BucketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketEvent::Blocked { route } => write!(f, "Blocked(route={})", route),
            BucketEvent::FallbackEngaged => write!(f, "FallbackEngaged"),
            BucketEvent::FailOpen { route } => write!(f, "FailOpen(route={})", route),
        }
    }
}

impl fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheEvent::Hit { source, stale } => {
                write!(f, "Hit(source={}, stale={})", source, stale)
            }
            CacheEvent::Miss { source } => write!(f, "Miss(source={})", source),
            CacheEvent::Bypass { source } => write!(f, "Bypass(source={})", source),
            CacheEvent::RefreshFailed { source } => write!(f, "RefreshFailed(source={})", source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_namespaced() {
        let event = PolicyEvent::TokenBucket(BucketEvent::Blocked { route: "/auth/login".into() });
        assert_eq!(event.to_string(), "TokenBucket::Blocked(route=/auth/login)");

        let event = PolicyEvent::Cache(CacheEvent::Hit { source: "listings".into(), stale: true });
        assert_eq!(event.to_string(), "Cache::Hit(source=listings, stale=true)");

        let event = PolicyEvent::FixedWindow(WindowEvent::Blocked { scope: "sensitive" });
        assert_eq!(event.to_string(), "FixedWindow::Blocked(scope=sensitive)");
    }
}
