//! Ready-made policies for the marketplace's protected endpoints.
//!
//! ```rust
//! use floodgate::rate_limit::{presets, PolicyTable};
//!
//! let table = PolicyTable::new()
//!     .route("/auth/login", presets::auth_login())
//!     .route("/auth/register", presets::auth_register())
//!     .route("/listings/search", presets::api_search())
//!     .class("/admin", presets::admin_actions())
//!     .class("/", presets::api_general());
//!
//! assert_eq!(table.resolve("/auth/login").unwrap().capacity(), 5.0);
//! ```

use super::policy::RateLimitPolicy;
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);

fn preset(capacity: f64, refill_rate: f64, window: Duration, message: &str) -> RateLimitPolicy {
    RateLimitPolicy::preset(capacity, refill_rate, window, message)
}

/// Login: 5 attempts, 1 token/s, idle reset after 15 minutes.
pub fn auth_login() -> RateLimitPolicy {
    preset(5.0, 1.0, 15 * MINUTE, "Too many login attempts. Please try again later.")
}

/// Registration: 3 attempts, one token every 2 s, idle reset after an hour.
pub fn auth_register() -> RateLimitPolicy {
    preset(3.0, 0.5, 60 * MINUTE, "Registration rate limit exceeded. Please try again later.")
}

/// General API traffic: 100 burst, 10 tokens/s.
pub fn api_general() -> RateLimitPolicy {
    preset(100.0, 10.0, MINUTE, "API rate limit exceeded.")
}

/// Search: 50 burst, 5 tokens/s.
pub fn api_search() -> RateLimitPolicy {
    preset(50.0, 5.0, MINUTE, "Search rate limit exceeded.")
}

/// Uploads: 10 burst, 1 token/s.
pub fn api_upload() -> RateLimitPolicy {
    preset(10.0, 1.0, MINUTE, "Upload rate limit exceeded.")
}

/// Admin actions: 20 burst, 2 tokens/s, bucketed per admin user (or client identity).
pub fn admin_actions() -> RateLimitPolicy {
    preset(20.0, 2.0, MINUTE, "Admin action rate limit exceeded.").with_key_generator(|req| {
        let who = req.user_id.as_deref().unwrap_or_else(|| req.identity());
        format!("admin:{who}")
    })
}
