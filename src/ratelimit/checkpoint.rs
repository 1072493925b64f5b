//! Admission checkpoint: the `allow` / `record` contract for one policy.

use std::sync::Arc;

use super::policy::RateLimitConfig;
use super::registry::LimiterRegistry;

/// Binds one policy to a registry.
///
/// Callers invoke `allow` before the guarded action and `record` after it.
/// `allow` never returns an error; store failures resolve to the policy's
/// `fail_open` setting and are indistinguishable from a normal denial.
#[derive(Clone)]
pub struct AdmissionCheckpoint {
    registry: Arc<LimiterRegistry>,
    config: RateLimitConfig,
}

impl AdmissionCheckpoint {
    pub fn new(registry: Arc<LimiterRegistry>, config: RateLimitConfig) -> Self {
        Self { registry, config }
    }

    /// Whether the caller identified by `key` may proceed now.
    pub async fn allow(&self, key: &str) -> bool {
        self.registry.allow(&self.config, key).await
    }

    /// Report that the guarded action ran for `key`.
    pub async fn record(&self, key: &str) {
        self.registry.record(&self.config, key).await
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}
