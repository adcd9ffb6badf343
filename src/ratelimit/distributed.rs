//! Redis-backed counter store.
//!
//! Shares rate limiting state across every process pointing at the same Redis.
//!
//! - Fixed windows: `INCR` + `PEXPIRE` in a `MULTI` pipeline, one key per bucket.
//! - Sliding windows: `ZREMRANGEBYSCORE` + `ZADD` + `ZCARD` + `PEXPIRE` in a
//!   `MULTI` pipeline. Members carry a UUID so simultaneous requests stay
//!   distinct.
//! - Token buckets: a Lua script, the only way to make the refill-and-take
//!   read-modify-write atomic.
//!
//! Keys expire through Redis TTLs, so `purge_expired` is a no-op.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::{BucketSpec, BucketState, CounterStore};
use crate::error::{PalisadeError, Result};

const TOKEN_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local refill_per_ms = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil or last_refill == nil then
  tokens = capacity
  last_refill = now
end

local elapsed = math.max(0, now - last_refill)
tokens = math.min(capacity, tokens + elapsed * refill_per_ms)

local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'last_refill', now)
redis.call('PEXPIRE', KEYS[1], ttl)
return {allowed, tostring(tokens)}
"#;

/// Configuration for the Redis store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1/`
    #[serde(default = "default_url")]
    pub url: String,
    /// Time allowed for a single store round trip
    #[serde(default = "default_timeout", with = "crate::config::duration_secs")]
    pub timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            timeout: default_timeout(),
        }
    }
}

fn default_url() -> String {
    "redis://127.0.0.1/".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_millis(250)
}

/// Counter store shared through Redis.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    token_bucket: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect with the given configuration.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the first connection fails.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let connection = ConnectionManager::new(client).await?;
        debug!(url = %config.url, "Connected to Redis counter store");

        Ok(Self {
            connection,
            config,
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }

    /// Run a store operation under the configured round-trip timeout.
    async fn bounded<T, F>(&self, op: F) -> Result<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.timeout, op).await {
            Ok(result) => result.map_err(PalisadeError::from),
            Err(_) => Err(PalisadeError::Store(format!(
                "Redis call exceeded {:?}",
                self.config.timeout
            ))),
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, _now: Duration, ttl: Duration) -> Result<u64> {
        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .ignore();

        let (count,): (u64,) = self.bounded(pipe.query_async(&mut conn)).await?;
        trace!(key = %key, count, "Incremented fixed window in Redis");
        Ok(count)
    }

    async fn record_and_count(&self, key: &str, now: Duration, window: Duration) -> Result<u64> {
        let now_ms = millis(now);
        let cutoff = now_ms.saturating_sub(millis(window));
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());

        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff)
            .ignore()
            .cmd("ZADD")
            .arg(key)
            .arg(now_ms)
            .arg(member)
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis(window))
            .ignore();

        let (count,): (u64,) = self.bounded(pipe.query_async(&mut conn)).await?;
        trace!(key = %key, count, "Recorded sliding window entry in Redis");
        Ok(count)
    }

    async fn take_token(&self, key: &str, now: Duration, spec: BucketSpec) -> Result<BucketState> {
        let mut conn = self.connection.clone();
        let mut invocation = self.token_bucket.key(key);
        invocation
            .arg(spec.capacity)
            .arg(spec.refill_per_ms)
            .arg(millis(now))
            .arg(millis(spec.ttl).max(1));

        let (allowed, tokens): (i64, String) =
            self.bounded(invocation.invoke_async(&mut conn)).await?;
        let tokens = tokens
            .parse::<f64>()
            .map_err(|e| PalisadeError::Store(format!("Bad token count from Redis: {}", e)))?;

        Ok(BucketState {
            allowed: allowed == 1,
            tokens,
        })
    }

    async fn purge_expired(&self, _now: Duration) -> Result<usize> {
        Ok(0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: String = self
            .bounded(redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
