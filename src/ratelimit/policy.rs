//! Rate limit policies.
//!
//! A [`RateLimitConfig`] is an immutable value: it is validated once when it
//! is built (or deserialized) and compared by content afterwards, which is how
//! the registry shares one limiter between equal policies.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AdmissionError, Result};

/// Prefix used for store keys when a policy does not name one.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit";

/// Longest accepted sliding window (ten years). Keeps the derived store TTL,
/// in seconds and in absolute milliseconds, well inside `i64`.
pub const MAX_WINDOW_SIZE_MILLIS: u64 = 10 * 365 * 24 * 60 * 60 * 1000;

/// Admission algorithm and its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum Algorithm {
    /// Bursts up to `capacity`, refilled at `refill_rate_per_second`.
    TokenBucket {
        capacity: u32,
        refill_rate_per_second: u32,
    },
    /// At most `max_requests` admissions in any trailing `window_size_millis`.
    SlidingWindow {
        window_size_millis: u64,
        max_requests: u32,
    },
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket { .. } => "token_bucket",
            Algorithm::SlidingWindow { .. } => "sliding_window",
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            Algorithm::TokenBucket {
                capacity,
                refill_rate_per_second,
            } => {
                if capacity == 0 {
                    return Err(AdmissionError::Config(
                        "token bucket capacity must be positive".to_string(),
                    ));
                }
                if refill_rate_per_second == 0 {
                    return Err(AdmissionError::Config(
                        "token bucket refill_rate_per_second must be positive".to_string(),
                    ));
                }
            }
            Algorithm::SlidingWindow {
                window_size_millis,
                max_requests,
            } => {
                if window_size_millis == 0 {
                    return Err(AdmissionError::Config(
                        "sliding window window_size_millis must be positive".to_string(),
                    ));
                }
                if window_size_millis > MAX_WINDOW_SIZE_MILLIS {
                    return Err(AdmissionError::Config(format!(
                        "sliding window window_size_millis {} exceeds the maximum of {}",
                        window_size_millis, MAX_WINDOW_SIZE_MILLIS
                    )));
                }
                if max_requests == 0 {
                    return Err(AdmissionError::Config(
                        "sliding window max_requests must be positive".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::TokenBucket {
                capacity,
                refill_rate_per_second,
            } => write!(f, "token_bucket(capacity={}, refill={}/s)", capacity, refill_rate_per_second),
            Algorithm::SlidingWindow {
                window_size_millis,
                max_requests,
            } => write!(f, "sliding_window(max={}, window={}ms)", max_requests, window_size_millis),
        }
    }
}

/// An admission policy: algorithm, failure mode and key namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRateLimitConfig")]
pub struct RateLimitConfig {
    #[serde(flatten)]
    algorithm: Algorithm,
    fail_open: bool,
    key_prefix: String,
}

/// Unvalidated form used while deserializing.
#[derive(Deserialize)]
struct RawRateLimitConfig {
    #[serde(flatten)]
    algorithm: Algorithm,
    #[serde(default)]
    fail_open: bool,
    #[serde(default = "default_key_prefix")]
    key_prefix: String,
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

impl TryFrom<RawRateLimitConfig> for RateLimitConfig {
    type Error = AdmissionError;

    fn try_from(raw: RawRateLimitConfig) -> Result<Self> {
        Ok(Self::new(raw.algorithm)?
            .with_fail_open(raw.fail_open)
            .with_key_prefix(raw.key_prefix))
    }
}

impl RateLimitConfig {
    /// Validate `algorithm` and build a fail-closed policy with the default key prefix.
    pub fn new(algorithm: Algorithm) -> Result<Self> {
        algorithm.validate()?;
        Ok(Self {
            algorithm,
            fail_open: false,
            key_prefix: default_key_prefix(),
        })
    }

    /// A token bucket policy.
    ///
    /// # Errors
    /// Returns `AdmissionError::Config` if either value is zero.
    pub fn token_bucket(capacity: u32, refill_rate_per_second: u32) -> Result<Self> {
        Self::new(Algorithm::TokenBucket {
            capacity,
            refill_rate_per_second,
        })
    }

    /// A sliding window policy.
    ///
    /// # Errors
    /// Returns `AdmissionError::Config` if the window rounds to zero
    /// milliseconds, exceeds [`MAX_WINDOW_SIZE_MILLIS`], or `max_requests` is zero.
    pub fn sliding_window(window: Duration, max_requests: u32) -> Result<Self> {
        let window_size_millis = u64::try_from(window.as_millis()).map_err(|_| {
            AdmissionError::Config(format!("sliding window {:?} is out of range", window))
        })?;
        Self::new(Algorithm::SlidingWindow {
            window_size_millis,
            max_requests,
        })
    }

    /// Return a copy that admits (`true`) or denies (`false`) while the store is unavailable.
    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Return a copy that namespaces its store keys under `prefix`.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn algorithm(&self) -> &Algorithm {
        &self.algorithm
    }

    pub fn fail_open(&self) -> bool {
        self.fail_open
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// The store key holding state for caller `key` under this policy.
    ///
    /// Format: `{key_prefix}:{algorithm}:{key}`, or `{algorithm}:{key}` when
    /// the prefix is empty.
    ///
    /// The algorithm's parameters are not part of the key. Two policies that
    /// share a prefix and an algorithm share state for the same caller key even
    /// if their capacity or window differs, so give such policies distinct
    /// prefixes.
    pub fn store_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            format!("{}:{}", self.algorithm.name(), key)
        } else {
            format!("{}:{}:{}", self.key_prefix, self.algorithm.name(), key)
        }
    }
}

impl fmt::Display for RateLimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} fail_open={} prefix={:?}",
            self.algorithm, self.fail_open, self.key_prefix
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket_validation() {
        assert!(RateLimitConfig::token_bucket(10, 1).is_ok());
        assert!(matches!(
            RateLimitConfig::token_bucket(0, 1),
            Err(AdmissionError::Config(_))
        ));
        assert!(matches!(
            RateLimitConfig::token_bucket(10, 0),
            Err(AdmissionError::Config(_))
        ));
    }

    #[test]
    fn test_sliding_window_validation() {
        assert!(RateLimitConfig::sliding_window(Duration::from_secs(1), 5).is_ok());
        assert!(RateLimitConfig::sliding_window(Duration::from_micros(500), 5).is_err());
        assert!(RateLimitConfig::sliding_window(Duration::from_secs(1), 0).is_err());
    }

    #[test]
    fn test_sliding_window_cap() {
        let at_cap = Algorithm::SlidingWindow {
            window_size_millis: MAX_WINDOW_SIZE_MILLIS,
            max_requests: 5,
        };
        assert!(RateLimitConfig::new(at_cap).is_ok());

        for window_size_millis in [MAX_WINDOW_SIZE_MILLIS + 1, i64::MAX as u64, u64::MAX] {
            let result = RateLimitConfig::new(Algorithm::SlidingWindow {
                window_size_millis,
                max_requests: 5,
            });
            assert!(matches!(result, Err(AdmissionError::Config(_))), "accepted {}", window_size_millis);
        }

        let yaml = format!(
            "algorithm: sliding_window\nwindow_size_millis: {}\nmax_requests: 5\n",
            i64::MAX
        );
        assert!(serde_yaml::from_str::<RateLimitConfig>(&yaml).is_err());
        assert!(RateLimitConfig::sliding_window(Duration::from_secs(u64::MAX), 5).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = RateLimitConfig::token_bucket(10, 1).unwrap();
        assert!(!config.fail_open());
        assert_eq!(config.key_prefix(), DEFAULT_KEY_PREFIX);
    }

    #[test]
    fn test_store_key() {
        let config = RateLimitConfig::token_bucket(10, 1)
            .unwrap()
            .with_key_prefix("login");
        assert_eq!(config.store_key("user-1"), "login:token_bucket:user-1");

        let config = RateLimitConfig::sliding_window(Duration::from_secs(1), 5)
            .unwrap()
            .with_key_prefix("");
        assert_eq!(config.store_key("user-1"), "sliding_window:user-1");
    }

    #[test]
    fn test_store_key_ignores_algorithm_parameters() {
        let small = RateLimitConfig::token_bucket(5, 1).unwrap();
        let large = RateLimitConfig::token_bucket(500, 10).unwrap();
        assert_eq!(small.store_key("user-1"), large.store_key("user-1"));

        let large = large.with_key_prefix("bulk");
        assert_ne!(small.store_key("user-1"), large.store_key("user-1"));
    }

    #[test]
    fn test_equality_is_by_content() {
        let a = RateLimitConfig::token_bucket(10, 1).unwrap().with_fail_open(true);
        let b = RateLimitConfig::token_bucket(10, 1).unwrap().with_fail_open(true);
        let c = RateLimitConfig::token_bucket(10, 1).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_parse_token_bucket_yaml() {
        let yaml = r#"
algorithm: token_bucket
capacity: 10
refill_rate_per_second: 2
fail_open: true
key_prefix: login
"#;
        let config: RateLimitConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.algorithm(),
            &Algorithm::TokenBucket {
                capacity: 10,
                refill_rate_per_second: 2
            }
        );
        assert!(config.fail_open());
        assert_eq!(config.key_prefix(), "login");
    }

    #[test]
    fn test_parse_sliding_window_yaml_with_defaults() {
        let yaml = r#"
algorithm: sliding_window
window_size_millis: 1000
max_requests: 5
"#;
        let config: RateLimitConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config, RateLimitConfig::sliding_window(Duration::from_secs(1), 5).unwrap());
    }

    #[test]
    fn test_parse_rejects_invalid_values() {
        let zero = r#"
algorithm: token_bucket
capacity: 0
refill_rate_per_second: 1
"#;
        let err = serde_yaml::from_str::<RateLimitConfig>(zero).unwrap_err();
        assert!(err.to_string().contains("capacity must be positive"));

        let negative = r#"
algorithm: sliding_window
window_size_millis: -1000
max_requests: 5
"#;
        assert!(serde_yaml::from_str::<RateLimitConfig>(negative).is_err());

        let unknown = r#"
algorithm: leaky_bucket
capacity: 5
"#;
        assert!(serde_yaml::from_str::<RateLimitConfig>(unknown).is_err());
    }

    #[test]
    fn test_serialize_round_trips_through_json() {
        let config = RateLimitConfig::sliding_window(Duration::from_millis(250), 3)
            .unwrap()
            .with_key_prefix("api");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["algorithm"], "sliding_window");
        assert_eq!(json["window_size_millis"], 250);

        let back: RateLimitConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
