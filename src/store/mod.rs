//! Shared atomic store abstraction.
//!
//! The store is the only synchronization point between processes: each
//! admission decision is a single script executed indivisibly against one key.

mod memory;
mod redis_store;
pub mod scripts;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::clock::Clock;
use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;

pub use memory::InMemoryStore;
pub use redis_store::RedisStore;
pub use scripts::ScriptId;

/// A single script argument. Arguments are positional and fixed per script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptArg {
    Int(i64),
    Str(String),
}

impl ScriptArg {
    /// The argument as an integer, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScriptArg::Int(v) => Some(*v),
            ScriptArg::Str(s) => s.parse().ok(),
        }
    }
}

impl fmt::Display for ScriptArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptArg::Int(v) => write!(f, "{}", v),
            ScriptArg::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ScriptArg {
    fn from(v: i64) -> Self {
        ScriptArg::Int(v)
    }
}

impl From<u32> for ScriptArg {
    fn from(v: u32) -> Self {
        ScriptArg::Int(v as i64)
    }
}

impl From<String> for ScriptArg {
    fn from(v: String) -> Self {
        ScriptArg::Str(v)
    }
}

/// A key-value backend that runs one scripted read-modify-write per call.
///
/// Implementations must guarantee that a script's effects on `key` are
/// indivisible with respect to every other `execute` on the same key. Any
/// failure (network, timeout, script error, unexpected reply) is reported as
/// `AdmissionError::StoreUnavailable`.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    async fn execute(&self, script: ScriptId, key: &str, args: &[ScriptArg]) -> Result<i64>;
}

/// Build the store described by `config`.
///
/// The in-memory backend shares `clock` for TTL expiry; Redis expires keys on
/// its own clock.
pub async fn connect(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn AtomicStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-process memory store");
            Ok(Arc::new(InMemoryStore::new(clock)))
        }
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.url, config.command_timeout()).await?;
            Ok(Arc::new(store))
        }
    }
}
