//! Admission scripts and their wire contract.
//!
//! Token bucket: `KEYS[1]` = bucket key,
//! `ARGV = [capacity, refill_rate_per_second, requested, now_millis]`.
//!
//! Sliding window: `KEYS[1]` = window key,
//! `ARGV = [window_size_millis, max_requests, now_millis, request_id]`.
//!
//! Both return `1` to admit and `0` to deny.

use std::fmt;

/// Idle lifetime of a token bucket hash.
pub const TOKEN_BUCKET_TTL_SECS: i64 = 3600;

/// Extra seconds a sliding window set outlives its window.
pub const SLIDING_WINDOW_TTL_MARGIN_SECS: i64 = 1;

/// Hash field holding the current token count.
pub const TOKENS_FIELD: &str = "tokens";

/// Hash field holding the last refill timestamp.
pub const LAST_REFILL_FIELD: &str = "last_refill";

/// Refill, try to take `requested` tokens, and always persist the new state.
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil or last_refill == nil then
    tokens = capacity
    last_refill = now
end

local elapsed = math.max(0, now - last_refill)
local refill = math.floor(elapsed / 1000 * rate)
tokens = math.min(capacity, tokens + refill)

local allowed = 0
if tokens >= requested then
    tokens = tokens - requested
    allowed = 1
end

redis.call('HSET', key, 'tokens', tokens, 'last_refill', now)
redis.call('EXPIRE', key, 3600)
return allowed
"#;

/// Trim expired entries, count, and insert only when under the limit.
pub const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local window = tonumber(ARGV[1])
local max_requests = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local request_id = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local current = redis.call('ZCARD', key)

local allowed = 0
if current < max_requests then
    redis.call('ZADD', key, now, request_id)
    allowed = 1
end

redis.call('EXPIRE', key, math.ceil(window / 1000) + 1)
return allowed
"#;

/// Identifies one of the admission scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptId {
    TokenBucket,
    SlidingWindow,
}

impl ScriptId {
    /// Lua source executed by script-capable stores.
    pub fn source(&self) -> &'static str {
        match self {
            ScriptId::TokenBucket => TOKEN_BUCKET_SCRIPT,
            ScriptId::SlidingWindow => SLIDING_WINDOW_SCRIPT,
        }
    }

    /// Number of positional arguments the script expects.
    pub fn arity(&self) -> usize {
        4
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptId::TokenBucket => "token_bucket",
            ScriptId::SlidingWindow => "sliding_window",
        }
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TTL in seconds applied to a sliding window set: `ceil(window / 1000) + margin`.
///
/// Saturates instead of overflowing for windows near `i64::MAX`.
pub fn sliding_window_ttl_secs(window_size_millis: i64) -> i64 {
    window_size_millis.saturating_add(999) / 1000 + SLIDING_WINDOW_TTL_MARGIN_SECS
}
