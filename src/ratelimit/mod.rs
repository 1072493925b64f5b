//! Admission algorithms, policy values and the limiter registry.

mod checkpoint;
mod limiter;
mod policy;
mod registry;
mod sliding_window;
mod token_bucket;

pub use checkpoint::AdmissionCheckpoint;
pub use limiter::{Decision, Limiter};
pub use policy::{Algorithm, RateLimitConfig, DEFAULT_KEY_PREFIX, MAX_WINDOW_SIZE_MILLIS};
pub use registry::LimiterRegistry;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;
