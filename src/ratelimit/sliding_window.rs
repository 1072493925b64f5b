//! Sliding window limiter.
//!
//! Admits at most `max_requests` in any trailing `window_size_millis`. The
//! store keeps one timestamped entry per admitted request; every call trims
//! entries that fell out of the window, counts the rest and inserts a new
//! entry only when admitting.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;
use uuid::Uuid;

use super::limiter::{Decision, Limiter};
use super::policy::{Algorithm, RateLimitConfig};
use crate::clock::Clock;
use crate::error::{AdmissionError, Result};
use crate::store::{AtomicStore, ScriptArg, ScriptId};

pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    window_size_millis: i64,
    max_requests: u32,
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    /// Create a limiter for a sliding window policy. Does not touch the store.
    ///
    /// # Errors
    /// Returns `AdmissionError::Config` if `config` uses another algorithm.
    pub fn new(config: RateLimitConfig, store: Arc<dyn AtomicStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let (window_size_millis, max_requests) = match *config.algorithm() {
            Algorithm::SlidingWindow {
                window_size_millis,
                max_requests,
            } => (window_size_millis, max_requests),
            ref other => {
                return Err(AdmissionError::Config(format!(
                    "sliding window limiter cannot enforce {}",
                    other
                )))
            }
        };
        let window_size_millis = i64::try_from(window_size_millis).map_err(|_| {
            AdmissionError::Config(format!("window of {}ms is out of range", window_size_millis))
        })?;

        Ok(Self::from_parts(config, window_size_millis, max_requests, store, clock))
    }

    pub(super) fn from_parts(
        config: RateLimitConfig,
        window_size_millis: i64,
        max_requests: u32,
        store: Arc<dyn AtomicStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            window_size_millis,
            max_requests,
            store,
            clock,
        }
    }

    /// Run one admission attempt with a caller-chosen request id.
    ///
    /// The id names the window entry created on admission, so it must be
    /// unique among requests for the same key.
    pub async fn check_with_request_id(&self, key: &str, request_id: &str) -> Result<Decision> {
        let store_key = self.config.store_key(key);
        let now = self.clock.now_millis();

        trace!(
            key = %store_key,
            max_requests = self.max_requests,
            window_ms = self.window_size_millis,
            now = now,
            "Checking sliding window"
        );

        let args = [
            ScriptArg::Int(self.window_size_millis),
            ScriptArg::from(self.max_requests),
            ScriptArg::Int(now),
            ScriptArg::Str(request_id.to_string()),
        ];
        let reply = self
            .store
            .execute(ScriptId::SlidingWindow, &store_key, &args)
            .await?;
        Decision::from_reply(reply)
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
    fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    async fn check(&self, key: &str) -> Result<Decision> {
        let request_id = format!("{}-{}", self.clock.now_millis(), Uuid::new_v4());
        self.check_with_request_id(key, &request_id).await
    }
}
