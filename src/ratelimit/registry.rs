//! Limiter registry.
//!
//! Memoizes one limiter per distinct policy for the life of the process. The
//! map is keyed by the policy value itself, so two equal policies built in
//! different places share a limiter. The number of entries is bounded by the
//! number of policies in use, not by the number of caller keys.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::limiter::Limiter;
use super::policy::{Algorithm, RateLimitConfig};
use super::sliding_window::SlidingWindowLimiter;
use super::token_bucket::TokenBucketLimiter;
use crate::clock::{Clock, SystemClock};
use crate::store::AtomicStore;

/// Concurrent map from policy to its limiter.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct LimiterRegistry {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
    limiters: DashMap<RateLimitConfig, Arc<dyn Limiter>>,
}

impl LimiterRegistry {
    /// Create a registry whose limiters stamp requests with the system clock.
    pub fn new(store: Arc<dyn AtomicStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock::new()))
    }

    /// Create a registry with a custom clock.
    pub fn with_clock(store: Arc<dyn AtomicStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            limiters: DashMap::new(),
        }
    }

    /// Get the limiter for `config`, building it on first use.
    ///
    /// Building a limiter never touches the store. When two callers race on a
    /// new policy, the first insert wins and both receive the same instance.
    pub fn get(&self, config: &RateLimitConfig) -> Arc<dyn Limiter> {
        if let Some(limiter) = self.limiters.get(config) {
            return Arc::clone(limiter.value());
        }

        let entry = self.limiters.entry(config.clone()).or_insert_with(|| {
            debug!(policy = %config, "Creating limiter");
            self.build(config)
        });
        Arc::clone(entry.value())
    }

    /// Check `key` against `config`, routing to the right algorithm.
    pub async fn allow(&self, config: &RateLimitConfig, key: &str) -> bool {
        self.get(config).allow(key).await
    }

    /// Record that the action guarded by `config` ran for `key`.
    pub async fn record(&self, config: &RateLimitConfig, key: &str) {
        self.get(config).record(key).await
    }

    /// Number of limiters built so far.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    fn build(&self, config: &RateLimitConfig) -> Arc<dyn Limiter> {
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);

        // Policies are validated on construction, so the window fits in i64.
        match *config.algorithm() {
            Algorithm::TokenBucket {
                capacity,
                refill_rate_per_second,
            } => Arc::new(TokenBucketLimiter::from_parts(
                config.clone(),
                capacity,
                refill_rate_per_second,
                store,
                clock,
            )),
            Algorithm::SlidingWindow {
                window_size_millis,
                max_requests,
            } => Arc::new(SlidingWindowLimiter::from_parts(
                config.clone(),
                window_size_millis as i64,
                max_requests,
                store,
                clock,
            )),
        }
    }
}
