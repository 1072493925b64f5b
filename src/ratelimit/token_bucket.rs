//! Token bucket limiter.
//!
//! Admits bursts up to `capacity` and refills at `refill_rate_per_second`.
//! The bucket itself lives only inside the store; each call sends the policy
//! and the caller's clock reading to the token bucket script, which refills,
//! tries to take one token and persists the result in one step.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::limiter::{Decision, Limiter};
use super::policy::{Algorithm, RateLimitConfig};
use crate::clock::Clock;
use crate::error::{AdmissionError, Result};
use crate::store::{AtomicStore, ScriptArg, ScriptId};

/// Tokens consumed by a single admission check.
const TOKENS_PER_REQUEST: i64 = 1;

pub struct TokenBucketLimiter {
    config: RateLimitConfig,
    capacity: u32,
    refill_rate_per_second: u32,
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    /// Create a limiter for a token bucket policy. Does not touch the store.
    ///
    /// # Errors
    /// Returns `AdmissionError::Config` if `config` uses another algorithm.
    pub fn new(config: RateLimitConfig, store: Arc<dyn AtomicStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let (capacity, refill_rate_per_second) = match *config.algorithm() {
            Algorithm::TokenBucket {
                capacity,
                refill_rate_per_second,
            } => (capacity, refill_rate_per_second),
            ref other => {
                return Err(AdmissionError::Config(format!(
                    "token bucket limiter cannot enforce {}",
                    other
                )))
            }
        };

        Ok(Self::from_parts(config, capacity, refill_rate_per_second, store, clock))
    }

    pub(super) fn from_parts(
        config: RateLimitConfig,
        capacity: u32,
        refill_rate_per_second: u32,
        store: Arc<dyn AtomicStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            capacity,
            refill_rate_per_second,
            store,
            clock,
        }
    }

    fn script_args(&self, now_millis: i64) -> [ScriptArg; 4] {
        [
            ScriptArg::from(self.capacity),
            ScriptArg::from(self.refill_rate_per_second),
            ScriptArg::Int(TOKENS_PER_REQUEST),
            ScriptArg::Int(now_millis),
        ]
    }
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    async fn check(&self, key: &str) -> Result<Decision> {
        let store_key = self.config.store_key(key);
        let now = self.clock.now_millis();

        trace!(
            key = %store_key,
            capacity = self.capacity,
            refill_rate = self.refill_rate_per_second,
            now = now,
            "Checking token bucket"
        );

        let reply = self
            .store
            .execute(ScriptId::TokenBucket, &store_key, &self.script_args(now))
            .await?;
        Decision::from_reply(reply)
    }
}
