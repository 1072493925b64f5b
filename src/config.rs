//! Configuration management for Ratekeeper.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AdmissionError, Result};
use crate::ratelimit::RateLimitConfig;

/// Prefix for environment variable overrides, e.g. `RATEKEEPER__STORE__URL`.
const ENV_PREFIX: &str = "RATEKEEPER";

/// Main configuration: where state lives and which policies exist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Named admission policies
    #[serde(default)]
    pub policies: BTreeMap<String, RateLimitConfig>,
}

/// Which backend holds limiter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local state; only useful for a single instance
    #[default]
    Memory,
    /// Shared Redis server
    Redis,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Upper bound for a single script call before it counts as unavailable
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_url(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn default_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_command_timeout_ms() -> u64 {
    250
}

impl ServiceConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ServiceConfig = serde_yaml::from_str(yaml)
            .map_err(|e| AdmissionError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, then apply `RATEKEEPER__*`
    /// environment overrides (`__` separates nested keys).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: ServiceConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a named policy.
    pub fn policy(&self, name: &str) -> Option<&RateLimitConfig> {
        self.policies.get(name)
    }

    fn validate(&self) -> Result<()> {
        if self.store.command_timeout_ms == 0 {
            return Err(AdmissionError::Config(
                "store.command_timeout_ms must be positive".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Redis && self.store.url.is_empty() {
            return Err(AdmissionError::Config(
                "store.url is required for the redis backend".to_string(),
            ));
        }
        Ok(())
    }
}
