//! Counter store backends for throttling.

use std::future::Future;
use std::time::Duration;

use config::StorageConfig;

use crate::ClientKey;

pub mod memory;
pub mod redis;
mod redis_pool;

pub use memory::InMemoryStorage;
pub use self::redis::RedisStorage;

/// Outcome of an atomic check-and-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitResult {
    /// Whether the hit was below the limit and has been counted.
    pub allowed: bool,
    /// The client's hit count after this call.
    pub hits: u64,
}

/// A volatile key-value store holding one expiring hit counter per client.
///
/// The store owns no throttling logic. `get_count`, `increment` and `refresh_expiry` are
/// independent operations; `check_and_increment` combines them atomically.
pub trait CounterStore: Send + Sync {
    /// The client's current hit count, zero if the counter does not exist or has expired.
    fn get_count(&self, key: &ClientKey) -> impl Future<Output = Result<u64, StorageError>> + Send;

    /// Increment the client's hit count, creating the counter if needed. Returns the new count.
    fn increment(&self, key: &ClientKey) -> impl Future<Output = Result<u64, StorageError>> + Send;

    /// Make the client's counter expire `ttl` from now. Does nothing if the counter does not exist.
    fn refresh_expiry(&self, key: &ClientKey, ttl: Duration) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// If the client's hit count is below `limit`, increment it and make it expire `ttl` from
    /// now, as one atomic operation. Counters at the limit are left untouched.
    fn check_and_increment(
        &self,
        key: &ClientKey,
        limit: u32,
        ttl: Duration,
    ) -> impl Future<Output = Result<HitResult, StorageError>> + Send;
}

/// Storage backend selected by configuration.
pub enum Storage {
    /// Counters in process memory.
    Memory(InMemoryStorage),
    /// Counters in Redis.
    Redis(RedisStorage),
}

impl Storage {
    /// Create the configured backend. Redis is connected and checked before this returns.
    pub async fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        let storage = match config {
            StorageConfig::Memory => Storage::Memory(InMemoryStorage::new()),
            StorageConfig::Redis(redis_config) => Storage::Redis(RedisStorage::connect(redis_config).await?),
        };

        Ok(storage)
    }
}

impl CounterStore for Storage {
    async fn get_count(&self, key: &ClientKey) -> Result<u64, StorageError> {
        match self {
            Storage::Memory(storage) => storage.get_count(key).await,
            Storage::Redis(storage) => storage.get_count(key).await,
        }
    }

    async fn increment(&self, key: &ClientKey) -> Result<u64, StorageError> {
        match self {
            Storage::Memory(storage) => storage.increment(key).await,
            Storage::Redis(storage) => storage.increment(key).await,
        }
    }

    async fn refresh_expiry(&self, key: &ClientKey, ttl: Duration) -> Result<(), StorageError> {
        match self {
            Storage::Memory(storage) => storage.refresh_expiry(key, ttl).await,
            Storage::Redis(storage) => storage.refresh_expiry(key, ttl).await,
        }
    }

    async fn check_and_increment(&self, key: &ClientKey, limit: u32, ttl: Duration) -> Result<HitResult, StorageError> {
        match self {
            Storage::Memory(storage) => storage.check_and_increment(key, limit, ttl).await,
            Storage::Redis(storage) => storage.check_and_increment(key, limit, ttl).await,
        }
    }
}

/// Errors that can occur in storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The store could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The store rejected or failed a command.
    #[error("Query error: {0}")]
    Query(String),

    /// The store did not answer within the response timeout.
    #[error("Store did not respond within {0:?}")]
    Timeout(Duration),
}
