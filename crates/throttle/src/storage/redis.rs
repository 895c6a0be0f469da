//! Redis counter storage.
//!
//! Each client has one hash under `<key_prefix><client key>` with a single `hits` field.
//! The window is the key's TTL: when it expires Redis deletes the hash and the client's
//! next hit starts a new count.

use std::future::Future;
use std::time::Duration;

use config::RedisConfig;
use deadpool::managed::Object;
use redis::{Cmd, FromRedisValue, RedisError, Script, aio::MultiplexedConnection};

use super::redis_pool::{self, Manager, Pool};
use super::{CounterStore, HitResult, StorageError};
use crate::ClientKey;

const HITS_FIELD: &str = "hits";

/// Read, compare, increment and expire in one server-side step. Only issues the same
/// `HGET`/`HINCRBY`/`EXPIRE` commands the two-step path uses.
const CHECK_AND_INCREMENT: &str = r"
local hits = tonumber(redis.call('HGET', KEYS[1], ARGV[3]) or '0')
if hits < tonumber(ARGV[1]) then
    hits = redis.call('HINCRBY', KEYS[1], ARGV[3], 1)
    redis.call('EXPIRE', KEYS[1], ARGV[2])
    return {1, hits}
end
return {0, hits}
";

/// Redis-based counter storage implementation.
pub struct RedisStorage {
    /// Redis connection pool.
    pool: Pool,
    /// Key prefix for all counter keys.
    key_prefix: String,
    /// Upper bound for a single command round-trip.
    response_timeout: Duration,
    script: Script,
}

impl RedisStorage {
    /// Connect to Redis and prepare it as a volatile counter cache.
    ///
    /// Fails if the server cannot be reached. On success the server's memory is capped at
    /// `max_memory_bytes` with `volatile-lru` eviction and snapshots to disk are disabled;
    /// servers that refuse `CONFIG SET` are used as they are, with a warning.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StorageError> {
        let storage = Self::with_pool(redis_pool::create_pool(config)?, config);

        // The first checkout opens the connection, so it gets the connection timeout on top.
        let pong: String = storage
            .query_within(config.connection_timeout + config.response_timeout, &redis::cmd("PING"))
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to ping Redis server: {e}")))?;

        log::debug!("Connected to Redis at {} ({pong})", config.url());

        let settings = [
            ("maxmemory", config.max_memory_bytes.to_string()),
            ("maxmemory-policy", "volatile-lru".to_string()),
            ("save", String::new()),
        ];

        for (parameter, value) in settings {
            let mut command = redis::cmd("CONFIG");
            command.arg("SET").arg(parameter).arg(&value);

            if let Err(e) = storage.query::<()>(&command).await {
                log::warn!("Redis refused to set {parameter} to {value:?}, using the server setting: {e}");
            }
        }

        Ok(storage)
    }

    fn with_pool(pool: Pool, config: &RedisConfig) -> Self {
        Self {
            pool,
            key_prefix: config.key_prefix.clone(),
            response_timeout: config.response_timeout,
            script: Script::new(CHECK_AND_INCREMENT),
        }
    }

    fn redis_key(&self, key: &ClientKey) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn connection(&self) -> Result<Object<Manager>, StorageError> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to get Redis connection from pool: {e}")))
    }

    /// Check out a connection and run `command` on it, both within the response timeout.
    ///
    /// A checkout may recycle or create a connection, which can stall on a server that
    /// keeps the socket open without answering.
    async fn query<T>(&self, command: &Cmd) -> Result<T, StorageError>
    where
        T: FromRedisValue,
    {
        self.query_within(self.response_timeout, command).await
    }

    async fn query_within<T>(&self, limit: Duration, command: &Cmd) -> Result<T, StorageError>
    where
        T: FromRedisValue,
    {
        bounded(limit, async {
            let mut conn = self.connection().await?;
            command.query_async(&mut *conn).await.map_err(classify)
        })
        .await
    }
}

impl CounterStore for RedisStorage {
    async fn get_count(&self, key: &ClientKey) -> Result<u64, StorageError> {
        let hits: Option<u64> = self.query(&Cmd::hget(self.redis_key(key), HITS_FIELD)).await?;

        Ok(hits.unwrap_or(0))
    }

    async fn increment(&self, key: &ClientKey) -> Result<u64, StorageError> {
        self.query(&Cmd::hincr(self.redis_key(key), HITS_FIELD, 1u64)).await
    }

    async fn refresh_expiry(&self, key: &ClientKey, ttl: Duration) -> Result<(), StorageError> {
        let _: i64 = self.query(&Cmd::expire(self.redis_key(key), expire_seconds(ttl))).await?;

        Ok(())
    }

    async fn check_and_increment(&self, key: &ClientKey, limit: u32, ttl: Duration) -> Result<HitResult, StorageError> {
        let key = self.redis_key(key);

        let mut invocation = self.script.key(&key);
        invocation.arg(limit).arg(expire_seconds(ttl)).arg(HITS_FIELD);

        let (allowed, hits): (i64, u64) = bounded(self.response_timeout, async {
            let mut conn = self.connection().await?;
            let conn: &mut MultiplexedConnection = &mut conn;

            invocation.invoke_async(conn).await.map_err(classify)
        })
        .await?;

        Ok(HitResult {
            allowed: allowed == 1,
            hits,
        })
    }
}

async fn bounded<T>(limit: Duration, operation: impl Future<Output = Result<T, StorageError>>) -> Result<T, StorageError> {
    tokio::time::timeout(limit, operation)
        .await
        .unwrap_or_else(|_| Err(StorageError::Timeout(limit)))
}

/// Redis expiries are whole seconds; anything shorter would delete the counter at once.
fn expire_seconds(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX)
}

fn classify(error: RedisError) -> StorageError {
    if error.is_io_error() || error.is_connection_dropped() || error.is_connection_refusal() {
        StorageError::Connection(error.to_string())
    } else {
        StorageError::Query(error.to_string())
    }
}
