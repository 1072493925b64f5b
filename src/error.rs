//! Error types for the admission-control core.

use thiserror::Error;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// Invalid policy or service configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared store could not execute a script (network, timeout or script error)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdmissionError {
    /// Returns true if this error came from the shared store.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, AdmissionError::StoreUnavailable(_))
    }
}

impl From<redis::RedisError> for AdmissionError {
    fn from(err: redis::RedisError) -> Self {
        AdmissionError::StoreUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for AdmissionError {
    fn from(err: config::ConfigError) -> Self {
        AdmissionError::Config(err.to_string())
    }
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, AdmissionError>;
