//! Limiter trait shared by both admission algorithms.

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::policy::RateLimitConfig;
use crate::error::{AdmissionError, Result};

/// Outcome of one admission script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Deny,
}

impl Decision {
    /// Map a script reply (`1` admit, `0` deny) to a decision.
    pub fn from_reply(reply: i64) -> Result<Self> {
        match reply {
            1 => Ok(Decision::Admit),
            0 => Ok(Decision::Deny),
            other => Err(AdmissionError::StoreUnavailable(format!(
                "unexpected script reply {}",
                other
            ))),
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit)
    }
}

/// An admission algorithm bound to one policy.
///
/// `check` reports what the store decided; `allow` is the hot-path contract
/// and never fails: a store error resolves to the policy's `fail_open` value.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// The policy this limiter enforces.
    fn config(&self) -> &RateLimitConfig;

    /// Run one atomic admission attempt for `key`.
    async fn check(&self, key: &str) -> Result<Decision>;

    /// Decide whether the caller identified by `key` may proceed now.
    async fn allow(&self, key: &str) -> bool {
        let config = self.config();
        match self.check(key).await {
            Ok(Decision::Admit) => {
                trace!(key = %key, algorithm = config.algorithm().name(), "Request admitted");
                true
            }
            Ok(Decision::Deny) => {
                debug!(key = %key, algorithm = config.algorithm().name(), "Rate limit exceeded");
                false
            }
            Err(e) => {
                warn!(
                    key = %key,
                    algorithm = config.algorithm().name(),
                    fail_open = config.fail_open(),
                    error = %e,
                    "Store unavailable, applying fallback decision"
                );
                config.fail_open()
            }
        }
    }

    /// Report that the guarded action ran.
    ///
    /// Both current algorithms consume quota inside `allow`, so this only
    /// emits an event. Algorithms that split check from commit override it.
    async fn record(&self, key: &str) {
        trace!(key = %key, algorithm = self.config().algorithm().name(), "Admission recorded");
    }
}
