//! Redis backend for `floodgate` (companion crate).
//!
//! [`RedisStore`] implements both [`Store`] and [`ScriptingStore`]: plain values go
//! through `GET` / `SET EX` / `DEL` / `KEYS`, and the token bucket runs as a Lua script
//! so that refill and consumption happen in one indivisible step on the server.
//!
//! Every command is bounded by an operation timeout. A slow Redis surfaces as
//! [`StoreError::Timeout`], which the guards treat like any other outage and fail open.

use async_trait::async_trait;
use floodgate::error::{ConfigError, StoreError};
use floodgate::store::{BucketScriptArgs, BucketScriptReply, ScriptingStore, Store};
use redis::aio::MultiplexedConnection;
use std::future::Future;
use std::time::Duration;

/// Refill-then-maybe-consume over a hash of `tokens` / `last_refill`.
///
/// Token counts travel as strings: Lua numbers are truncated to integers on the way
/// out of a script, which would lose the fractional refill.
const TOKEN_BUCKET_LUA: &str = r#"
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local window_ms = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local now = tonumber(ARGV[5])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil or last_refill == nil then
  tokens = capacity
  last_refill = now
end

local elapsed = math.max(0, now - last_refill)
tokens = math.min(capacity, math.max(0, tokens + (elapsed / 1000) * refill_rate))

local allowed = 0
if tokens >= requested then
  tokens = tokens - requested
  allowed = 1
end

redis.call('HMSET', KEYS[1], 'tokens', tostring(tokens), 'last_refill', tostring(math.max(now, last_refill)))
redis.call('EXPIRE', KEYS[1], math.max(1, math.ceil(window_ms / 1000)))
return {allowed, tostring(tokens), tostring(capacity)}
"#;

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(250);

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisStoreConfig {
    url: String,
    op_timeout: Duration,
}

impl RedisStoreConfig {
    /// Connect to `url` (`redis://host:port/db`) with the default 250ms operation timeout.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), op_timeout: DEFAULT_OP_TIMEOUT }
    }

    /// Bound every command by `timeout`.
    ///
    /// # Errors
    /// Returns `Err` when `timeout` is zero.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::DurationOutOfRange { field: "op_timeout", provided: timeout });
        }
        self.op_timeout = timeout;
        Ok(self)
    }

    /// Connection URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Per-command timeout.
    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    /// Read `REDIS_URL`, or `REDIS_HOST` / `REDIS_PORT`, plus `REDIS_OP_TIMEOUT_MS`.
    ///
    /// A `.env` file in the working directory is loaded first when present.
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
        let url = match lookup("REDIS_URL").filter(|v| !v.trim().is_empty()) {
            Some(url) => url.trim().to_string(),
            None => {
                let host = lookup("REDIS_HOST").unwrap_or_else(|| "localhost".to_string());
                let port = match lookup("REDIS_PORT") {
                    Some(raw) => raw.trim().parse::<u16>().map_err(|e| ConfigError::InvalidEnv {
                        name: "REDIS_PORT",
                        value: raw.clone(),
                        reason: e.to_string(),
                    })?,
                    None => 6379,
                };
                format!("redis://{}:{port}", host.trim())
            }
        };

        let config = Self::new(url);
        match lookup("REDIS_OP_TIMEOUT_MS") {
            Some(raw) => {
                let millis = raw.trim().parse::<u64>().map_err(|e| ConfigError::InvalidEnv {
                    name: "REDIS_OP_TIMEOUT_MS",
                    value: raw.clone(),
                    reason: e.to_string(),
                })?;
                config.with_op_timeout(Duration::from_millis(millis))
            }
            None => Ok(config),
        }
    }
}

/// Shared store backed by one multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    script: redis::Script,
    op_timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("conn", &"<redis::aio::MultiplexedConnection>")
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Open a client and establish the multiplexed connection.
    pub async fn connect(config: &RedisStoreConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = tokio::time::timeout(
            config.op_timeout(),
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| StoreError::Timeout { op: "connect", after: config.op_timeout() })?
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        tracing::debug!(url = %config.url(), "connected to redis");
        Ok(Self::from_connection(conn, config.op_timeout()))
    }

    /// Wrap an existing connection.
    pub fn from_connection(conn: MultiplexedConnection, op_timeout: Duration) -> Self {
        Self { conn, script: redis::Script::new(TOKEN_BUCKET_LUA), op_timeout }
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify(op, &e)),
            Err(_) => Err(StoreError::Timeout { op, after: self.op_timeout }),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("GET").arg(key).clone();
        self.bounded("get", async move { cmd.query_async(&mut conn).await }).await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("SET").arg(key).arg(value).arg("EX").arg(ttl_secs(ttl)).clone();
        self.bounded("set", async move { cmd.query_async(&mut conn).await }).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("DEL").arg(key).clone();
        let removed: u64 =
            self.bounded("delete", async move { cmd.query_async(&mut conn).await }).await?;
        tracing::trace!(key, removed, "redis DEL");
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("KEYS").arg(literal_brackets(pattern)).clone();
        self.bounded("keys", async move { cmd.query_async(&mut conn).await }).await
    }

    fn supports_key_scan(&self) -> bool {
        true
    }
}

#[async_trait]
impl ScriptingStore for RedisStore {
    async fn eval_token_bucket(
        &self,
        key: &str,
        args: BucketScriptArgs,
    ) -> Result<BucketScriptReply, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.script.key(key);
        invocation
            .arg(args.capacity)
            .arg(args.refill_rate)
            .arg(args.window_ms)
            .arg(args.requested_tokens)
            .arg(args.now_ms);

        let (allowed, tokens, capacity): (i64, String, String) = self
            .bounded("eval", async move { invocation.invoke_async(&mut conn).await })
            .await?;
        parse_reply(allowed, &tokens, &capacity)
    }
}

fn parse_reply(allowed: i64, tokens: &str, capacity: &str) -> Result<BucketScriptReply, StoreError> {
    let number = |field: &str, raw: &str| {
        raw.trim()
            .parse::<f64>()
            .map_err(|e| StoreError::Codec(format!("bucket script returned {field}={raw:?}: {e}")))
    };
    Ok(BucketScriptReply {
        allowed: allowed == 1,
        tokens_remaining: number("tokens", tokens)?,
        capacity: number("capacity", capacity)?,
    })
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn classify(op: &'static str, err: &redis::RedisError) -> StoreError {
    if op == "eval" && script_unsupported(err.code(), &err.to_string()) {
        return StoreError::ScriptUnsupported(err.to_string());
    }
    StoreError::Unavailable(format!("{op}: {err}"))
}

/// Errors meaning this server will never run the script, as opposed to a transient
/// failure of one evaluation.
fn script_unsupported(code: Option<&str>, message: &str) -> bool {
    if matches!(code, Some("NOSCRIPT" | "NOPERM")) {
        return true;
    }
    let message = message.to_ascii_lowercase();
    message.contains("unknown command")
        || message.contains("scripting is disabled")
        || message.contains("no scripts")
}

/// Escape the glob syntax Redis supports beyond `*` and `?`, so `KEYS` matches
/// the same keys as the in-memory store.
fn literal_brackets(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
