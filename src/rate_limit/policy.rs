//! Token-bucket policies and the route table they are attached through.

use super::request::RequestDescriptor;
use crate::error::PolicyError;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Derives the bucket identity for a request (without the `rate_limit:` prefix).
pub type KeyGenerator = Arc<dyn Fn(&RequestDescriptor) -> String + Send + Sync>;

/// Returns true when a request should bypass the bucket entirely.
pub type SkipPredicate = Arc<dyn Fn(&RequestDescriptor) -> bool + Send + Sync>;

const DEFAULT_MESSAGE: &str = "Rate limit exceeded";

/// Validated per-route token-bucket configuration.
///
/// Pure data: cloning is cheap and a policy carries no bucket state of its own.
#[derive(Clone)]
pub struct RateLimitPolicy {
    capacity: f64,
    refill_rate: f64,
    window: Duration,
    key_generator: Option<KeyGenerator>,
    skip_if: Option<SkipPredicate>,
    message: String,
}

impl fmt::Debug for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitPolicy")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .field("window", &self.window)
            .field("key_generator", &self.key_generator.is_some())
            .field("skip_if", &self.skip_if.is_some())
            .field("message", &self.message)
            .finish()
    }
}

impl RateLimitPolicy {
    /// `capacity` tokens, refilled at `refill_rate` tokens per second; idle buckets
    /// expire after `window`.
    pub fn new(capacity: f64, refill_rate: f64, window: Duration) -> Result<Self, PolicyError> {
        if !(capacity.is_finite() && capacity > 0.0) {
            return Err(PolicyError::InvalidCapacity { provided: capacity });
        }
        if !(refill_rate.is_finite() && refill_rate > 0.0) {
            return Err(PolicyError::InvalidRefillRate { provided: refill_rate });
        }
        if window < Duration::from_millis(1) {
            return Err(PolicyError::InvalidWindow(window));
        }
        Ok(Self {
            capacity,
            refill_rate,
            window,
            key_generator: None,
            skip_if: None,
            message: DEFAULT_MESSAGE.to_string(),
        })
    }

    /// Built-in constants that are known to be valid.
    pub(super) fn preset(capacity: f64, refill_rate: f64, window: Duration, message: &str) -> Self {
        Self {
            capacity,
            refill_rate,
            window,
            key_generator: None,
            skip_if: None,
            message: message.to_string(),
        }
    }

    /// Use a custom bucket identity instead of `identity:route`.
    pub fn with_key_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&RequestDescriptor) -> String + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(generator));
        self
    }

    /// Skip the check for requests matching `predicate` (e.g. internal callers).
    pub fn skip_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RequestDescriptor) -> bool + Send + Sync + 'static,
    {
        self.skip_if = Some(Arc::new(predicate));
        self
    }

    /// Message returned to the client on denial.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Maximum tokens.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Idle bucket lifetime.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Idle bucket lifetime in milliseconds.
    pub fn window_ms(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }

    /// Denial message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the skip predicate exempts `req`.
    pub fn should_skip(&self, req: &RequestDescriptor) -> bool {
        self.skip_if.as_ref().is_some_and(|skip| skip(req))
    }

    /// Store key of the bucket `req` draws from.
    pub fn bucket_key(&self, req: &RequestDescriptor) -> String {
        match &self.key_generator {
            Some(generate) => format!("rate_limit:{}", generate(req)),
            None => format!("rate_limit:{}:{}", req.identity(), req.route_or_path()),
        }
    }
}

/// Route-to-policy lookup built at startup.
///
/// Exact route templates win; otherwise the longest matching class prefix applies;
/// otherwise the route is unprotected.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    routes: HashMap<String, RateLimitPolicy>,
    classes: Vec<(String, RateLimitPolicy)>,
}

impl PolicyTable {
    /// Empty table: nothing is protected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `policy` to one route template.
    pub fn route(mut self, route: impl Into<String>, policy: RateLimitPolicy) -> Self {
        self.routes.insert(route.into(), policy);
        self
    }

    /// Attach `policy` to every route under `prefix` that has no policy of its own.
    pub fn class(mut self, prefix: impl Into<String>, policy: RateLimitPolicy) -> Self {
        let prefix = prefix.into();
        self.classes.retain(|(existing, _)| existing != &prefix);
        self.classes.push((prefix, policy));
        self.classes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    /// Policy for `route`, if any.
    pub fn resolve(&self, route: &str) -> Option<&RateLimitPolicy> {
        self.routes.get(route).or_else(|| {
            self.classes
                .iter()
                .find(|(prefix, _)| route.starts_with(prefix.as_str()))
                .map(|(_, policy)| policy)
        })
    }

    /// Number of route and class entries.
    pub fn len(&self) -> usize {
        self.routes.len() + self.classes.len()
    }

    /// True when nothing is protected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(capacity: f64) -> RateLimitPolicy {
        RateLimitPolicy::new(capacity, 1.0, Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn rejects_non_positive_values() {
        assert!(matches!(
            RateLimitPolicy::new(0.0, 1.0, Duration::from_secs(1)),
            Err(PolicyError::InvalidCapacity { .. })
        ));
        assert!(matches!(
            RateLimitPolicy::new(5.0, f64::NAN, Duration::from_secs(1)),
            Err(PolicyError::InvalidRefillRate { .. })
        ));
        assert_eq!(
            RateLimitPolicy::new(5.0, 1.0, Duration::ZERO).unwrap_err(),
            PolicyError::InvalidWindow(Duration::ZERO)
        );
    }

    #[test]
    fn default_key_is_identity_and_route() {
        let req = RequestDescriptor::new("POST", "/listings/7")
            .with_route("/listings/:id")
            .with_remote_addr("10.0.0.1");
        assert_eq!(policy(5.0).bucket_key(&req), "rate_limit:10.0.0.1:/listings/:id");
        assert_eq!(policy(5.0).message(), "Rate limit exceeded");
    }

    #[test]
    fn custom_key_and_skip() {
        let p = policy(5.0)
            .with_key_generator(|req| format!("user:{}", req.user_id.as_deref().unwrap_or("anon")))
            .skip_when(|req| req.real_ip.as_deref() == Some("127.0.0.1"));

        let req = RequestDescriptor::new("GET", "/search").with_user("u9");
        assert_eq!(p.bucket_key(&req), "rate_limit:user:u9");
        assert!(!p.should_skip(&req));
        assert!(p.should_skip(&req.with_real_ip("127.0.0.1")));
    }

    #[test]
    fn table_prefers_route_then_longest_class() {
        let table = PolicyTable::new()
            .class("/api", policy(100.0))
            .class("/api/admin", policy(20.0))
            .route("/api/admin/audit", policy(1.0));

        assert_eq!(table.resolve("/api/admin/audit").map(|p| p.capacity()), Some(1.0));
        assert_eq!(table.resolve("/api/admin/users").map(|p| p.capacity()), Some(20.0));
        assert_eq!(table.resolve("/api/listings").map(|p| p.capacity()), Some(100.0));
        assert!(table.resolve("/health").is_none());
        assert_eq!(table.len(), 3);
    }
}
