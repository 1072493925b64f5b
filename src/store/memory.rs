//! In-process atomic store.
//!
//! Runs the same two admission scripts as the Redis backend, natively, under a
//! single lock so every call is indivisible. Key expiry follows the same TTLs
//! the Lua scripts set, measured against the supplied clock.
//!
//! Useful for single-process deployments and for exercising limiters in tests,
//! including simulated outages via [`InMemoryStore::set_available`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::scripts::{self, ScriptId};
use super::{AtomicStore, ScriptArg};
use crate::clock::Clock;
use crate::error::{AdmissionError, Result};

/// Expired keys are swept roughly once per this many script calls.
const EVICTION_INTERVAL: u64 = 100;

/// Value stored under a key, mirroring the Redis data type each script uses.
#[derive(Debug, Clone)]
enum Value {
    /// Hash `{tokens, last_refill}`
    Bucket { tokens: i64, last_refill: i64 },
    /// Sorted set of `(timestamp, request_id)`
    Window(BTreeSet<(i64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: i64,
}

/// Atomic store that keeps all state in process memory.
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    ops_counter: AtomicU64,
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("keys", &self.entries.lock().len())
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

impl InMemoryStore {
    /// Create an empty store. `clock` decides when keys expire.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
            ops_counter: AtomicU64::new(0),
        }
    }

    /// Switch the store on or off. While off, every call fails with
    /// `StoreUnavailable` and no state is touched.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining lifetime of `key` in milliseconds, if it exists.
    pub fn ttl_millis(&self, key: &str) -> Option<i64> {
        let now = self.clock.now_millis();
        self.entries
            .lock()
            .get(key)
            .map(|entry| entry.expires_at - now)
            .filter(|ttl| *ttl > 0)
    }

    fn maybe_evict_expired(&self, entries: &mut HashMap<String, Entry>, now: i64) {
        let count = self.ops_counter.fetch_add(1, Ordering::Relaxed);
        if count % EVICTION_INTERVAL != 0 {
            return;
        }
        entries.retain(|_, entry| entry.expires_at > now);
    }

    fn token_bucket(entries: &mut HashMap<String, Entry>, key: &str, args: &[ScriptArg], now: i64) -> Result<i64> {
        let capacity = int_arg(ScriptId::TokenBucket, args, 0)?;
        let rate = int_arg(ScriptId::TokenBucket, args, 1)?;
        let requested = int_arg(ScriptId::TokenBucket, args, 2)?;
        let script_now = int_arg(ScriptId::TokenBucket, args, 3)?;

        let (tokens, last_refill) = match live_value(entries, key, now) {
            Some(Value::Bucket { tokens, last_refill }) => (*tokens, *last_refill),
            Some(Value::Window(_)) => return Err(wrong_type(key)),
            None => (capacity, script_now),
        };

        let elapsed = script_now.saturating_sub(last_refill).max(0) as i128;
        let refill = elapsed * rate as i128 / 1000;
        let mut tokens = (tokens as i128 + refill).min(capacity as i128) as i64;

        let allowed = if tokens >= requested {
            tokens = tokens.saturating_sub(requested);
            1
        } else {
            0
        };

        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Bucket {
                    tokens,
                    last_refill: script_now,
                },
                expires_at: expiry(now, scripts::TOKEN_BUCKET_TTL_SECS),
            },
        );

        Ok(allowed)
    }

    fn sliding_window(entries: &mut HashMap<String, Entry>, key: &str, args: &[ScriptArg], now: i64) -> Result<i64> {
        let window = int_arg(ScriptId::SlidingWindow, args, 0)?;
        let max_requests = int_arg(ScriptId::SlidingWindow, args, 1)?;
        let script_now = int_arg(ScriptId::SlidingWindow, args, 2)?;
        let request_id = args[3].to_string();

        // Taken out of the map while it is updated; put back below unless empty.
        let mut set = match entries.remove(key) {
            Some(entry) if entry.expires_at > now => match entry.value {
                Value::Window(set) => set,
                value @ Value::Bucket { .. } => {
                    entries.insert(
                        key.to_string(),
                        Entry {
                            value,
                            expires_at: entry.expires_at,
                        },
                    );
                    return Err(wrong_type(key));
                }
            },
            _ => BTreeSet::new(),
        };

        // Keep only entries with timestamp > now - window.
        let window_start = script_now.saturating_sub(window);
        let mut set = set.split_off(&(window_start.saturating_add(1), String::new()));

        let allowed = if (set.len() as i64) < max_requests {
            set.retain(|(_, id)| id != &request_id);
            set.insert((script_now, request_id));
            1
        } else {
            0
        };

        // An empty sorted set does not exist in Redis either.
        if !set.is_empty() {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Window(set),
                    expires_at: expiry(now, scripts::sliding_window_ttl_secs(window)),
                },
            );
        }

        Ok(allowed)
    }
}

fn live_value<'a>(entries: &'a HashMap<String, Entry>, key: &str, now: i64) -> Option<&'a Value> {
    entries
        .get(key)
        .filter(|entry| entry.expires_at > now)
        .map(|entry| &entry.value)
}

fn expiry(now: i64, ttl_secs: i64) -> i64 {
    now.saturating_add(ttl_secs.saturating_mul(1000))
}

fn int_arg(script: ScriptId, args: &[ScriptArg], index: usize) -> Result<i64> {
    args[index].as_int().ok_or_else(|| {
        AdmissionError::StoreUnavailable(format!(
            "{} script argument {} is not an integer: {}",
            script,
            index + 1,
            args[index]
        ))
    })
}

fn wrong_type(key: &str) -> AdmissionError {
    AdmissionError::StoreUnavailable(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

#[async_trait]
impl AtomicStore for InMemoryStore {
    async fn execute(&self, script: ScriptId, key: &str, args: &[ScriptArg]) -> Result<i64> {
        if !self.is_available() {
            return Err(AdmissionError::StoreUnavailable(
                "memory store is marked unavailable".to_string(),
            ));
        }
        if args.len() != script.arity() {
            return Err(AdmissionError::StoreUnavailable(format!(
                "{} script expects {} arguments, got {}",
                script,
                script.arity(),
                args.len()
            )));
        }

        let mut entries = self.entries.lock();
        let now = self.clock.now_millis();
        self.maybe_evict_expired(&mut entries, now);

        let reply = match script {
            ScriptId::TokenBucket => Self::token_bucket(&mut entries, key, args, now)?,
            ScriptId::SlidingWindow => Self::sliding_window(&mut entries, key, args, now)?,
        };

        trace!(script = %script, key = %key, reply = reply, "Executed memory script");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn store_with_clock() -> (InMemoryStore, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        (InMemoryStore::new(Arc::new(clock.clone())), clock)
    }

    fn bucket_args(capacity: i64, rate: i64, now: i64) -> Vec<ScriptArg> {
        vec![
            ScriptArg::Int(capacity),
            ScriptArg::Int(rate),
            ScriptArg::Int(1),
            ScriptArg::Int(now),
        ]
    }

    fn window_args(window: i64, max: i64, now: i64, id: &str) -> Vec<ScriptArg> {
        vec![
            ScriptArg::Int(window),
            ScriptArg::Int(max),
            ScriptArg::Int(now),
            ScriptArg::Str(id.to_string()),
        ]
    }

    #[tokio::test]
    async fn test_token_bucket_starts_full() {
        let (store, clock) = store_with_clock();
        let now = clock.now_millis();

        for _ in 0..3 {
            assert_eq!(store.execute(ScriptId::TokenBucket, "k", &bucket_args(3, 1, now)).await.unwrap(), 1);
        }
        assert_eq!(store.execute(ScriptId::TokenBucket, "k", &bucket_args(3, 1, now)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_token_bucket_refill_is_floored() {
        let (store, _clock) = store_with_clock();

        assert_eq!(store.execute(ScriptId::TokenBucket, "k", &bucket_args(1, 1, 0)).await.unwrap(), 1);
        // 999ms at 1 token/s refills nothing.
        assert_eq!(store.execute(ScriptId::TokenBucket, "k", &bucket_args(1, 1, 999)).await.unwrap(), 0);
        // last_refill moved to 999 on the denial, so the partial second is dropped.
        assert_eq!(store.execute(ScriptId::TokenBucket, "k", &bucket_args(1, 1, 1998)).await.unwrap(), 0);
        assert_eq!(store.execute(ScriptId::TokenBucket, "k", &bucket_args(1, 1, 2998)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_token_bucket_clock_going_backwards_refills_nothing() {
        let (store, _clock) = store_with_clock();

        assert_eq!(store.execute(ScriptId::TokenBucket, "k", &bucket_args(1, 10, 5_000)).await.unwrap(), 1);
        assert_eq!(store.execute(ScriptId::TokenBucket, "k", &bucket_args(1, 10, 1_000)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_token_bucket_expires_after_ttl() {
        let (store, clock) = store_with_clock();
        let now = clock.now_millis();

        store.execute(ScriptId::TokenBucket, "k", &bucket_args(5, 1, now)).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.ttl_millis("k"), Some(3_600_000));

        clock.advance(Duration::from_secs(3600));
        assert_eq!(store.len(), 0);
        assert_eq!(store.ttl_millis("k"), None);
    }

    #[tokio::test]
    async fn test_sliding_window_trims_inclusive_boundary() {
        let (store, _clock) = store_with_clock();

        assert_eq!(store.execute(ScriptId::SlidingWindow, "w", &window_args(1000, 2, 0, "a")).await.unwrap(), 1);
        assert_eq!(store.execute(ScriptId::SlidingWindow, "w", &window_args(1000, 2, 500, "b")).await.unwrap(), 1);
        assert_eq!(store.execute(ScriptId::SlidingWindow, "w", &window_args(1000, 2, 999, "c")).await.unwrap(), 0);
        // Entry at 0 is now <= window start and gets trimmed.
        assert_eq!(store.execute(ScriptId::SlidingWindow, "w", &window_args(1000, 2, 1000, "d")).await.unwrap(), 1);
        assert_eq!(store.execute(ScriptId::SlidingWindow, "w", &window_args(1000, 2, 1001, "e")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sliding_window_denial_does_not_insert() {
        let (store, _clock) = store_with_clock();

        assert_eq!(store.execute(ScriptId::SlidingWindow, "w", &window_args(1000, 1, 0, "a")).await.unwrap(), 1);
        for (i, now) in [100, 200, 300].into_iter().enumerate() {
            let id = format!("denied-{}", i);
            assert_eq!(store.execute(ScriptId::SlidingWindow, "w", &window_args(1000, 1, now, &id)).await.unwrap(), 0);
        }
        // Only the admitted entry was counted, so it ages out at 1000.
        assert_eq!(store.execute(ScriptId::SlidingWindow, "w", &window_args(1000, 1, 1000, "b")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sliding_window_ttl() {
        let (store, _clock) = store_with_clock();

        store.execute(ScriptId::SlidingWindow, "w", &window_args(1500, 5, 0, "a")).await.unwrap();
        assert_eq!(store.ttl_millis("w"), Some(3_000));
    }

    #[tokio::test]
    async fn test_wrong_type_is_an_error() {
        let (store, clock) = store_with_clock();
        let now = clock.now_millis();

        store.execute(ScriptId::TokenBucket, "shared", &bucket_args(5, 1, now)).await.unwrap();
        let result = store
            .execute(ScriptId::SlidingWindow, "shared", &window_args(1000, 5, now, "a"))
            .await;
        assert!(matches!(result, Err(AdmissionError::StoreUnavailable(_))));

        // The bucket survives the failed call.
        assert_eq!(store.ttl_millis("shared"), Some(3_600_000));
        for _ in 0..4 {
            assert_eq!(store.execute(ScriptId::TokenBucket, "shared", &bucket_args(5, 1, now)).await.unwrap(), 1);
        }
        assert_eq!(store.execute(ScriptId::TokenBucket, "shared", &bucket_args(5, 1, now)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sliding_window_keeps_entries_across_calls() {
        let (store, _clock) = store_with_clock();

        for (i, now) in [0, 10, 20].into_iter().enumerate() {
            let id = format!("req-{}", i);
            assert_eq!(store.execute(ScriptId::SlidingWindow, "w", &window_args(1000, 3, now, &id)).await.unwrap(), 1);
        }
        assert_eq!(store.execute(ScriptId::SlidingWindow, "w", &window_args(1000, 3, 30, "req-3")).await.unwrap(), 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_extreme_arguments_do_not_overflow() {
        let (store, clock) = store_with_clock();
        let now = clock.now_millis();

        let reply = store
            .execute(ScriptId::SlidingWindow, "w", &window_args(i64::MAX, 1, 0, "a"))
            .await
            .unwrap();
        assert_eq!(reply, 1);
        assert_eq!(store.ttl_millis("w"), Some(i64::MAX - now));

        // Window start saturates at i64::MIN, so the entry at 0 still counts.
        for (script_now, id) in [(i64::MIN, "b"), (i64::MAX - 1, "c")] {
            let reply = store
                .execute(ScriptId::SlidingWindow, "w", &window_args(i64::MAX, 1, script_now, id))
                .await
                .unwrap();
            assert_eq!(reply, 0);
        }

        assert_eq!(store.execute(ScriptId::TokenBucket, "k", &bucket_args(1, i64::MAX, i64::MIN)).await.unwrap(), 1);
        assert_eq!(store.execute(ScriptId::TokenBucket, "k", &bucket_args(1, i64::MAX, i64::MAX)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bad_arguments_are_errors() {
        let (store, _clock) = store_with_clock();

        let result = store.execute(ScriptId::TokenBucket, "k", &[ScriptArg::Int(1)]).await;
        assert!(matches!(result, Err(AdmissionError::StoreUnavailable(_))));

        let mut args = bucket_args(5, 1, 0);
        args[0] = ScriptArg::Str("five".to_string());
        let result = store.execute(ScriptId::TokenBucket, "k", &args).await;
        assert!(matches!(result, Err(AdmissionError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_without_touching_state() {
        let (store, clock) = store_with_clock();
        let now = clock.now_millis();

        store.set_available(false);
        let result = store.execute(ScriptId::TokenBucket, "k", &bucket_args(1, 1, now)).await;
        assert!(result.unwrap_err().is_store_unavailable());
        assert!(store.is_empty());

        store.set_available(true);
        assert_eq!(store.execute(ScriptId::TokenBucket, "k", &bucket_args(1, 1, now)).await.unwrap(), 1);
    }
}
