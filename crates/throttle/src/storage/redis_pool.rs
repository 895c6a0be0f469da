//! Redis connection pool for the counter store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use config::RedisConfig;
use deadpool::managed::{self, Metrics};
use redis::{Client, RedisError, RedisResult, aio::MultiplexedConnection};

use super::StorageError;

/// Redis connection pool.
pub(crate) type Pool = managed::Pool<Manager>;

/// Manager for Redis connections.
#[derive(Debug)]
pub(crate) struct Manager {
    client: Client,
    connection_timeout: Duration,
    ping_number: AtomicUsize,
}

impl Manager {
    fn new(config: &RedisConfig) -> RedisResult<Self> {
        Ok(Self {
            client: Client::open(config.url())?,
            connection_timeout: config.connection_timeout,
            ping_number: AtomicUsize::new(0),
        })
    }
}

impl managed::Manager for Manager {
    type Type = MultiplexedConnection;
    type Error = RedisError;

    async fn create(&self) -> Result<MultiplexedConnection, Self::Error> {
        match tokio::time::timeout(self.connection_timeout, self.client.get_multiplexed_async_connection()).await {
            Ok(conn) => conn,
            Err(_) => Err(RedisError::from((
                redis::ErrorKind::IoError,
                "Timed out connecting to Redis",
                format!("no connection after {:?}", self.connection_timeout),
            ))),
        }
    }

    async fn recycle(&self, conn: &mut MultiplexedConnection, _: &Metrics) -> managed::RecycleResult<Self::Error> {
        let ping_number = self.ping_number.fetch_add(1, Ordering::Relaxed).to_string();

        let (n,) = redis::Pipeline::with_capacity(2)
            .cmd("UNWATCH")
            .ignore()
            .cmd("PING")
            .arg(&ping_number)
            .query_async::<(String,)>(conn)
            .await?;

        if n == ping_number {
            Ok(())
        } else {
            Err(managed::RecycleError::message("Invalid PING response"))
        }
    }
}

/// Create a Redis connection pool from configuration. No connection is opened yet.
pub(crate) fn create_pool(config: &RedisConfig) -> Result<Pool, StorageError> {
    let manager = Manager::new(config)
        .map_err(|e| StorageError::Connection(format!("Invalid Redis address {}: {e}", config.url())))?;

    let mut pool_config = managed::PoolConfig::new(config.pool.max_size);
    pool_config.timeouts.create = Some(config.connection_timeout);
    pool_config.timeouts.wait = config.pool.timeout_wait;
    pool_config.timeouts.recycle = config.pool.timeout_recycle;

    Pool::builder(manager)
        .config(pool_config)
        .runtime(deadpool::Runtime::Tokio1)
        .build()
        .map_err(|e| StorageError::Connection(format!("Failed to create Redis connection pool: {e}")))
}
