//! In-memory counter storage.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use super::{CounterStore, HitResult, StorageError};
use crate::ClientKey;

/// Number of counter writes between two sweeps of expired counters.
const SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug, Default)]
struct Counter {
    hits: u64,
    expires_at: Option<Instant>,
}

impl Counter {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory counter storage implementation.
///
/// Mirrors the Redis semantics in a single process: counters expire lazily on access, and
/// every [`SWEEP_INTERVAL`] writes all expired counters are dropped so clients that never
/// return do not accumulate.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    counters: DashMap<String, Counter>,
    writes: AtomicU64,
}

impl InMemoryStorage {
    /// Create a new in-memory storage instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of counters currently held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether no counters are held.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Drop every expired counter.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.counters.retain(|_, counter| !counter.is_expired(now));
    }

    fn record_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;

        if writes % SWEEP_INTERVAL == 0 {
            log::debug!("Sweeping expired in-memory counters after {writes} writes");
            self.sweep_expired();
        }
    }

    fn drop_if_expired(&self, key: &ClientKey, now: Instant) {
        self.counters.remove_if(key.as_str(), |_, counter| counter.is_expired(now));
    }
}

impl CounterStore for InMemoryStorage {
    async fn get_count(&self, key: &ClientKey) -> Result<u64, StorageError> {
        self.drop_if_expired(key, Instant::now());

        Ok(self.counters.get(key.as_str()).map(|counter| counter.hits).unwrap_or(0))
    }

    async fn increment(&self, key: &ClientKey) -> Result<u64, StorageError> {
        let now = Instant::now();

        let hits = {
            let mut counter = self.counters.entry(key.as_str().to_owned()).or_default();

            if counter.is_expired(now) {
                *counter = Counter::default();
            }

            counter.hits += 1;
            counter.hits
        };

        self.record_write();

        Ok(hits)
    }

    async fn refresh_expiry(&self, key: &ClientKey, ttl: Duration) -> Result<(), StorageError> {
        let now = Instant::now();
        self.drop_if_expired(key, now);

        if let Some(mut counter) = self.counters.get_mut(key.as_str()) {
            counter.expires_at = Some(now + ttl);
        }

        Ok(())
    }

    async fn check_and_increment(&self, key: &ClientKey, limit: u32, ttl: Duration) -> Result<HitResult, StorageError> {
        let now = Instant::now();

        let result = {
            // The entry guard holds the shard lock for the whole read-compare-write.
            let mut counter = self.counters.entry(key.as_str().to_owned()).or_default();

            if counter.is_expired(now) {
                *counter = Counter::default();
            }

            if counter.hits < u64::from(limit) {
                counter.hits += 1;
                counter.expires_at = Some(now + ttl);

                HitResult {
                    allowed: true,
                    hits: counter.hits,
                }
            } else {
                HitResult {
                    allowed: false,
                    hits: counter.hits,
                }
            }
        };

        if result.allowed {
            self.record_write();
        } else if result.hits == 0 {
            // A zero limit would otherwise leave an empty counter behind that never expires.
            self.counters.remove_if(key.as_str(), |_, counter| counter.hits == 0);
        }

        Ok(result)
    }
}
