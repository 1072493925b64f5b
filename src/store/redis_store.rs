//! Redis-backed atomic store.
//!
//! Scripts run through `redis::Script`, which sends `EVALSHA` and falls back to
//! `EVAL` when the server has not cached the script yet. Redis executes a Lua
//! script without interleaving other commands, which gives each admission
//! decision its atomicity.
//!
//! Every call is bounded by a command timeout. A timeout, a connection error or
//! a script error all surface as `AdmissionError::StoreUnavailable`, and no
//! call is retried here.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisWrite, Script, ToRedisArgs};
use tracing::{info, trace};

use super::scripts::ScriptId;
use super::{AtomicStore, ScriptArg};
use crate::error::{AdmissionError, Result};

impl ToRedisArgs for ScriptArg {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        match self {
            ScriptArg::Int(v) => v.write_redis_args(out),
            ScriptArg::Str(s) => s.write_redis_args(out),
        }
    }
}

/// Atomic store backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    token_bucket: Script,
    sliding_window: Script,
    command_timeout: Duration,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1/")
    /// * `command_timeout` - Upper bound for connecting and for each script call
    ///
    /// # Errors
    /// Returns `StoreUnavailable` if the URL is invalid or the server cannot be reached.
    pub async fn connect(url: &str, command_timeout: Duration) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = tokio::time::timeout(command_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                AdmissionError::StoreUnavailable(format!(
                    "timed out after {:?} connecting to {}",
                    command_timeout, url
                ))
            })??;

        info!(url = %url, timeout = ?command_timeout, "Connected to Redis store");

        Ok(Self {
            connection,
            token_bucket: Script::new(ScriptId::TokenBucket.source()),
            sliding_window: Script::new(ScriptId::SlidingWindow.source()),
            command_timeout,
        })
    }

    fn script(&self, id: ScriptId) -> &Script {
        match id {
            ScriptId::TokenBucket => &self.token_bucket,
            ScriptId::SlidingWindow => &self.sliding_window,
        }
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn execute(&self, script: ScriptId, key: &str, args: &[ScriptArg]) -> Result<i64> {
        if args.len() != script.arity() {
            return Err(AdmissionError::StoreUnavailable(format!(
                "{} script expects {} arguments, got {}",
                script,
                script.arity(),
                args.len()
            )));
        }

        let mut invocation = self.script(script).key(key);
        for arg in args {
            invocation.arg(arg);
        }

        trace!(script = %script, key = %key, "Invoking Redis script");

        // ConnectionManager is a cheap handle onto one multiplexed connection.
        let mut conn = self.connection.clone();
        let reply: i64 = tokio::time::timeout(self.command_timeout, invocation.invoke_async(&mut conn))
            .await
            .map_err(|_| {
                AdmissionError::StoreUnavailable(format!(
                    "{} script timed out after {:?}",
                    script, self.command_timeout
                ))
            })??;

        Ok(reply)
    }
}
