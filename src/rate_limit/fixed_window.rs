//! Fixed-window request counting.
//!
//! Each client gets one counter per `floor(now / window)` bucket. Windows are aligned to
//! the epoch, so every process sharing the store agrees on the boundaries. A client can
//! land up to `2 * max` requests around a boundary; this guard is the coarse first line,
//! the token bucket is the precise one.

use super::request::RequestDescriptor;
use super::{Decision, Quota};
use crate::adaptive::DynamicConfig;
use crate::clock::Clock;
use crate::error::{AdmissionDenied, ConfigError, DenialSource, StoreError};
use crate::store::{ttl_from_millis, Store};
use crate::telemetry::{EventEmitter, PolicyEvent, WindowEvent};
use std::sync::Arc;
use std::time::Duration;

const DENIAL_MESSAGE: &str = "Too Many Requests";

/// Validated limit for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindowConfig {
    max: u64,
    window: Duration,
}

impl FixedWindowConfig {
    /// At most `max` requests per `window` (at least one second).
    pub fn new(max: u64, window: Duration) -> Result<Self, ConfigError> {
        if max == 0 {
            return Err(ConfigError::NonPositive { field: "max", provided: 0.0 });
        }
        if window < Duration::from_secs(1) {
            return Err(ConfigError::DurationOutOfRange { field: "window", provided: window });
        }
        Ok(Self { max, window })
    }

    /// Requests allowed per window.
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    fn window_ms(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Both tiers plus the path rules that pick between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedWindowSettings {
    /// Limit for every non-exempt, non-sensitive path.
    pub default_tier: FixedWindowConfig,
    /// Stricter limit for sensitive paths.
    pub sensitive_tier: FixedWindowConfig,
    /// Path prefixes that use the sensitive tier.
    pub sensitive_prefixes: Vec<String>,
    /// Path prefixes that are never counted.
    pub exempt_prefixes: Vec<String>,
}

impl Default for FixedWindowSettings {
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        Self {
            default_tier: FixedWindowConfig { max: 120, window: minute },
            sensitive_tier: FixedWindowConfig { max: 10, window: minute },
            sensitive_prefixes: vec!["/auth/login".into(), "/auth/register".into()],
            exempt_prefixes: vec!["/health".into(), "/docs".into(), "/metrics".into()],
        }
    }
}

impl FixedWindowSettings {
    /// Read overrides from the process environment, loading `.env` first if present.
    ///
    /// Recognised: `RATE_LIMIT_MAX`, `RATE_LIMIT_WINDOW_MS`, `RATE_LIMIT_AUTH_MAX`,
    /// `RATE_LIMIT_AUTH_WINDOW_MS`, `RATE_LIMIT_SENSITIVE_PREFIXES` (comma-separated).
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "failed to load .env file");
            }
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let tier = |max_var: &'static str,
                    window_var: &'static str,
                    fallback: FixedWindowConfig|
         -> Result<FixedWindowConfig, ConfigError> {
            let max = parse_var(&lookup, max_var)?.unwrap_or(fallback.max);
            let window = parse_var(&lookup, window_var)?
                .map(Duration::from_millis)
                .unwrap_or(fallback.window);
            FixedWindowConfig::new(max, window)
        };

        let default_tier = tier("RATE_LIMIT_MAX", "RATE_LIMIT_WINDOW_MS", defaults.default_tier)?;
        let sensitive_tier =
            tier("RATE_LIMIT_AUTH_MAX", "RATE_LIMIT_AUTH_WINDOW_MS", defaults.sensitive_tier)?;
        let sensitive_prefixes = match lookup("RATE_LIMIT_SENSITIVE_PREFIXES") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_owned)
                .collect(),
            None => defaults.sensitive_prefixes,
        };

        Ok(Self { default_tier, sensitive_tier, sensitive_prefixes, ..defaults })
    }
}

fn parse_var<F>(lookup: &F, name: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse::<u64>().map(Some).map_err(|e| ConfigError::InvalidEnv {
            name,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Global,
    Sensitive,
}

impl Scope {
    fn label(self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Sensitive => "sensitive",
        }
    }

    fn key(self, identity: &str, window_index: u64) -> String {
        match self {
            Scope::Global => format!("rl:{identity}:{window_index}"),
            Scope::Sensitive => format!("rl:auth:{identity}:{window_index}"),
        }
    }
}

/// Coarse per-client request counter over a shared [`Store`].
#[derive(Debug, Clone)]
pub struct FixedWindowGuard {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    default_tier: DynamicConfig<FixedWindowConfig>,
    sensitive_tier: DynamicConfig<FixedWindowConfig>,
    sensitive_prefixes: Arc<[String]>,
    exempt_prefixes: Arc<[String]>,
    emitter: EventEmitter,
}

impl FixedWindowGuard {
    /// Build a guard over `store`.
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, settings: FixedWindowSettings) -> Self {
        Self {
            store,
            clock,
            default_tier: DynamicConfig::new(settings.default_tier),
            sensitive_tier: DynamicConfig::new(settings.sensitive_tier),
            sensitive_prefixes: settings.sensitive_prefixes.into(),
            exempt_prefixes: settings.exempt_prefixes.into(),
            emitter: EventEmitter::null(),
        }
    }

    /// Send block and fail-open events to `emitter`.
    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Live handle to the default tier.
    pub fn default_tier(&self) -> &DynamicConfig<FixedWindowConfig> {
        &self.default_tier
    }

    /// Live handle to the sensitive tier.
    pub fn sensitive_tier(&self) -> &DynamicConfig<FixedWindowConfig> {
        &self.sensitive_tier
    }

    /// Count `req` against its window.
    ///
    /// Store failures are returned as-is; the caller picks the failure policy.
    pub async fn check(&self, req: &RequestDescriptor) -> Result<Decision, StoreError> {
        let path = req.path.as_str();
        if self.exempt_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            return Ok(Decision::Exempt);
        }

        let (scope, tier) = if self.sensitive_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            (Scope::Sensitive, self.sensitive_tier.get())
        } else {
            (Scope::Global, self.default_tier.get())
        };

        let now = self.clock.now_millis();
        let window_ms = tier.window_ms();
        let window_index = now / window_ms;
        let reset_at_ms = window_index.saturating_add(1).saturating_mul(window_ms);
        let key = scope.key(req.identity(), window_index);

        let current = match self.store.get(&key).await? {
            Some(raw) => serde_json::from_str::<u64>(&raw)?,
            None => 0,
        };

        if current >= tier.max {
            tracing::debug!(key = %key, count = current, max = tier.max, "fixed window exhausted");
            self.emitter.emit(PolicyEvent::FixedWindow(WindowEvent::Blocked { scope: scope.label() }));
            return Ok(Decision::Denied(AdmissionDenied::new(
                DENIAL_MESSAGE,
                Duration::from_millis(reset_at_ms - now),
                reset_at_ms,
                DenialSource::FixedWindow,
            )));
        }

        let next = current + 1;
        self.store.set(&key, next.to_string(), ttl_from_millis(reset_at_ms - now)).await?;

        Ok(Decision::Allowed(Quota { remaining: tier.max.saturating_sub(next), reset_at_ms }))
    }

    /// [`check`](Self::check) with fail-open: a store error allows the request and is
    /// logged at `warn`.
    pub async fn check_or_allow(&self, req: &RequestDescriptor) -> Decision {
        match self.check(req).await {
            Ok(decision) => decision,
            Err(e) => {
                let sensitive = self.sensitive_prefixes.iter().any(|p| req.path.starts_with(p.as_str()));
                let scope = if sensitive { Scope::Sensitive } else { Scope::Global };
                tracing::warn!(
                    path = %req.path,
                    identity = %req.identity(),
                    error = %e,
                    "fixed window store failed; allowing request"
                );
                self.emitter.emit(PolicyEvent::FixedWindow(WindowEvent::FailOpen { scope: scope.label() }));
                Decision::FailOpen
            }
        }
    }
}
