//! Ratekeeper - Distributed Admission Control
//!
//! This crate decides, for a caller key, whether an action may proceed under a
//! quota shared by many independent processes. Every decision is a single
//! script executed atomically by a shared store, so no process ever holds
//! limiter state or takes a distributed lock.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{AdmissionError, Result};
pub use ratelimit::{AdmissionCheckpoint, Algorithm, Decision, Limiter, LimiterRegistry, RateLimitConfig};
pub use store::{AtomicStore, InMemoryStore, RedisStore};
