//! Redis-backed quota store.
//!
//! Shares quota state across instances through Redis. Every algorithm runs
//! as a Lua script so the read-modify-write is atomic on the server, and the
//! scripts read the server's own `TIME` so all instances account against a
//! single clock regardless of local skew.
//!
//! ## Data model
//!
//! - Token bucket / windows: a hash per key (`tokens`/`stamp`, or window
//!   fields), expired via TTL
//! - Sliding window log: a sorted set per key scored by arrival time, with
//!   the cost encoded in the member
//!
//! ## Example
//!
//! ```rust,ignore
//! use quota_gate::{AdmissionEngine, Policy, RedisQuotaStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = RedisQuotaStore::connect("redis://127.0.0.1/")
//!         .await
//!         .expect("Failed to connect to Redis");
//!
//!     let engine = AdmissionEngine::builder(store, Policy::token_bucket(100, 10.0).unwrap())
//!         .build()
//!         .unwrap();
//! }
//! ```

use crate::application::ports::{ConsumeOutcome, QuotaStore, StoreError};
use crate::domain::key::RateLimitKey;
use crate::domain::policy::{Algorithm, Policy};
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Reply shape shared by all scripts: allowed flag, then remaining,
/// retry-after seconds (-1 when waiting will not help) and granted lease
/// tokens as stringified floats, since Lua numbers truncate to integers on
/// the way back.
type ScriptReply = (i64, String, String, String);

const TOKEN_BUCKET_SCRIPT: &str = r#"
redis.replicate_commands()
local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1e6
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local lease = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])
local eps = 1e-9

local state = redis.call('HMGET', KEYS[1], 'tokens', 'stamp')
local tokens = tonumber(state[1])
local stamp = tonumber(state[2])
if tokens == nil then
  tokens = capacity
  stamp = now
end
local elapsed = now - stamp
if elapsed > 0 then
  tokens = math.min(capacity, tokens + elapsed * rate)
else
  now = stamp
end

if tokens + eps >= cost then
  tokens = tokens - cost
  local granted = math.min(lease, tokens)
  if granted < 0 then granted = 0 end
  tokens = tokens - granted
  redis.call('HSET', KEYS[1], 'tokens', tokens, 'stamp', now)
  redis.call('EXPIRE', KEYS[1], ttl)
  return {1, tostring(tokens), '-1', tostring(granted)}
end

redis.call('HSET', KEYS[1], 'tokens', tokens, 'stamp', now)
redis.call('EXPIRE', KEYS[1], ttl)
local retry = -1
if rate > 0 then
  retry = (cost - tokens) / rate
end
return {0, tostring(tokens), tostring(retry), '0'}
"#;

const FIXED_WINDOW_SCRIPT: &str = r#"
redis.replicate_commands()
local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1e6
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local lease = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])
local eps = 1e-9

local state = redis.call('HMGET', KEYS[1], 'start', 'used')
local start = tonumber(state[1])
local used = tonumber(state[2])
if start == nil then
  start = now
  used = 0
elseif now - start >= window then
  -- Windows stay phase-aligned with the first request
  start = now - ((now - start) % window)
  used = 0
end

if used + cost <= capacity + eps then
  used = used + cost
  local granted = math.min(lease, capacity - used)
  if granted < 0 then granted = 0 end
  used = used + granted
  redis.call('HSET', KEYS[1], 'start', start, 'used', used)
  redis.call('EXPIRE', KEYS[1], ttl)
  return {1, tostring(capacity - used), '-1', tostring(granted)}
end

redis.call('HSET', KEYS[1], 'start', start, 'used', used)
redis.call('EXPIRE', KEYS[1], ttl)
local retry = start + window - now
if cost > capacity then
  retry = -1
end
return {0, tostring(capacity - used), tostring(retry), '0'}
"#;

const SLIDING_COUNTER_SCRIPT: &str = r#"
redis.replicate_commands()
local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1e6
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local lease = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])
local eps = 1e-9

local state = redis.call('HMGET', KEYS[1], 'start', 'cur', 'prev')
local start = tonumber(state[1])
local cur = tonumber(state[2])
local prev = tonumber(state[3])
if start == nil then
  start = now
  cur = 0
  prev = 0
else
  local elapsed = now - start
  if elapsed >= 2 * window then
    start = now - (elapsed % window)
    prev = 0
    cur = 0
  elseif elapsed >= window then
    start = start + window
    prev = cur
    cur = 0
  end
end

local fraction = (now - start) / window
local weighted = prev * (1 - fraction) + cur

if weighted + cost <= capacity + eps then
  cur = cur + cost
  local granted = math.min(lease, capacity - weighted - cost)
  if granted < 0 then granted = 0 end
  cur = cur + granted
  redis.call('HSET', KEYS[1], 'start', start, 'cur', cur, 'prev', prev)
  redis.call('EXPIRE', KEYS[1], ttl)
  return {1, tostring(capacity - weighted - cost - granted), '-1', tostring(granted)}
end

redis.call('HSET', KEYS[1], 'start', start, 'cur', cur, 'prev', prev)
redis.call('EXPIRE', KEYS[1], ttl)
local retry = -1
if cur + cost <= capacity + eps and prev > 0 then
  -- Waiting lets the previous window's weight decay away
  local deficit = weighted + cost - capacity
  local wait = deficit / prev * window
  local boundary = start + window - now
  if wait > boundary then wait = boundary end
  retry = wait
end
return {0, tostring(capacity - weighted), tostring(retry), '0'}
"#;

const SLIDING_LOG_SCRIPT: &str = r#"
redis.replicate_commands()
local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1e6
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local lease = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])
local nonce = ARGV[6]
local eps = 1e-9

redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. (now - window))

local total = 0
local entries = redis.call('ZRANGE', KEYS[1], 0, -1, 'WITHSCORES')
for i = 1, #entries, 2 do
  total = total + tonumber(string.match(entries[i], ':([^:]+)$'))
end

if total + cost <= capacity + eps then
  local granted = math.min(lease, capacity - total - cost)
  if granted < 0 then granted = 0 end
  local spent = cost + granted
  redis.call('ZADD', KEYS[1], now, nonce .. ':' .. tostring(spent))
  redis.call('EXPIRE', KEYS[1], ttl)
  return {1, tostring(capacity - total - spent), '-1', tostring(granted)}
end

redis.call('EXPIRE', KEYS[1], ttl)
local retry = -1
if cost <= capacity + eps then
  -- Oldest entries expiring one by one free up room
  local deficit = total + cost - capacity
  local freed = 0
  for i = 1, #entries, 2 do
    freed = freed + tonumber(string.match(entries[i], ':([^:]+)$'))
    if freed + eps >= deficit then
      retry = tonumber(entries[i + 1]) + window - now
      if retry < 0 then retry = 0 end
      break
    end
  end
end
return {0, tostring(capacity - total), tostring(retry), '0'}
"#;

/// Configuration for the Redis quota store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// TTL for idle keys (default: 1 hour).
    pub ttl: Duration,
    /// Prefix for Redis keys (default: "quota-gate:").
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            key_prefix: "quota-gate:".to_string(),
        }
    }
}

/// Quota store sharing state across instances via Redis.
#[derive(Clone)]
pub struct RedisQuotaStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    token_bucket: Script,
    fixed_window: Script,
    sliding_counter: Script,
    sliding_log: Script,
}

impl fmt::Debug for RedisQuotaStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisQuotaStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisQuotaStore {
    /// Connect to Redis with default configuration.
    ///
    /// # Errors
    /// Returns error if connection fails.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    ///
    /// # Errors
    /// Returns error if connection fails.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        Ok(Self {
            connection,
            config,
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
            fixed_window: Script::new(FIXED_WINDOW_SCRIPT),
            sliding_counter: Script::new(SLIDING_COUNTER_SCRIPT),
            sliding_log: Script::new(SLIDING_LOG_SCRIPT),
        })
    }

    fn redis_key(&self, key: &RateLimitKey) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn script_for(&self, algorithm: Algorithm) -> &Script {
        match algorithm {
            Algorithm::TokenBucket => &self.token_bucket,
            Algorithm::FixedWindow => &self.fixed_window,
            Algorithm::SlidingWindowCounter => &self.sliding_counter,
            Algorithm::SlidingWindowLog => &self.sliding_log,
        }
    }

    async fn run_consume(
        &self,
        key: &RateLimitKey,
        cost: f64,
        lease_request: f64,
        policy: &Policy,
    ) -> Result<ConsumeOutcome, StoreError> {
        let script = self.script_for(policy.algorithm);
        let mut invocation = script.prepare_invoke();
        invocation.key(self.redis_key(key)).arg(policy.capacity);

        if policy.algorithm == Algorithm::TokenBucket {
            invocation.arg(policy.refill_per_second);
        } else {
            invocation.arg(policy.window.as_secs_f64());
        }
        invocation
            .arg(cost)
            .arg(lease_request)
            .arg(self.config.ttl.as_secs().max(1));
        if policy.algorithm == Algorithm::SlidingWindowLog {
            // Unique member so concurrent arrivals never collide in the set
            invocation.arg(format!("{:016x}", rand::random::<u64>()));
        }

        let mut conn = self.connection.clone();
        let reply: ScriptReply = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        parse_reply(reply)
    }
}

fn parse_reply((allowed, remaining, retry, granted): ScriptReply) -> Result<ConsumeOutcome, StoreError> {
    let parse = |field: &str| {
        field
            .parse::<f64>()
            .map_err(|e| StoreError::Backend(format!("malformed script reply: {e}")))
    };
    let retry = parse(&retry)?;
    Ok(ConsumeOutcome {
        allowed: allowed == 1,
        remaining: parse(&remaining)?,
        retry_after: (retry >= 0.0).then(|| Duration::from_secs_f64(retry)),
        granted: parse(&granted)?,
    })
}

fn map_redis_error(error: RedisError) -> StoreError {
    if error.is_timeout() {
        StoreError::DeadlineExceeded
    } else if error.is_connection_refusal() || error.is_connection_dropped() || error.is_io_error()
    {
        StoreError::Unavailable(error.to_string())
    } else {
        StoreError::Backend(error.to_string())
    }
}

impl QuotaStore for RedisQuotaStore {
    fn atomic_consume(
        &self,
        key: &RateLimitKey,
        cost: f64,
        lease_request: f64,
        policy: &Policy,
    ) -> impl Future<Output = Result<ConsumeOutcome, StoreError>> + Send {
        self.run_consume(key, cost, lease_request, policy)
    }

    fn ping(&self) -> impl Future<Output = Result<(), StoreError>> + Send {
        let mut conn = self.connection.clone();
        async move {
            let reply: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            debug_assert_eq!(reply, "PONG");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_parsing() {
        let outcome =
            parse_reply((1, "7.5".to_string(), "-1".to_string(), "2".to_string())).unwrap();
        assert!(outcome.allowed);
        assert!((outcome.remaining - 7.5).abs() < 1e-9);
        assert_eq!(outcome.retry_after, None);
        assert!((outcome.granted - 2.0).abs() < 1e-9);

        let denied =
            parse_reply((0, "0".to_string(), "1.25".to_string(), "0".to_string())).unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_secs_f64(1.25)));
    }

    #[test]
    fn test_malformed_reply_is_backend_error() {
        let err = parse_reply((1, "oops".to_string(), "-1".to_string(), "0".to_string()))
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }
}
