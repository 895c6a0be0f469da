//! Request throttling configuration structures.

use std::time::Duration;

use anyhow::bail;
use duration_str::{deserialize_duration, deserialize_option_duration};
use serde::Deserialize;

/// Fixed-window throttling configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThrottleConfig {
    /// Maximum number of requests a client may make within one window.
    pub max_requests_per_interval: u32,
    /// Length of the window. Every accepted request pushes the end of the window
    /// this far into the future.
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    /// What to do with a request when the counter store cannot be consulted.
    pub on_store_error: StoreErrorPolicy,
    /// How the hit counter is read and updated.
    pub counting: CountingMode,
    /// Counter store backend.
    pub storage: StorageConfig,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_requests_per_interval: 10,
            interval: Duration::from_secs(1),
            on_store_error: StoreErrorPolicy::default(),
            counting: CountingMode::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl ThrottleConfig {
    /// Returns a copy of this configuration with every field present in `update` replaced.
    pub fn merged(&self, update: &ThrottleConfigUpdate) -> ThrottleConfig {
        let mut config = self.clone();

        if let Some(limit) = update.max_requests_per_interval {
            config.max_requests_per_interval = limit;
        }

        if let Some(interval) = update.interval {
            config.interval = interval;
        }

        if let Some(policy) = update.on_store_error {
            config.on_store_error = policy;
        }

        if let Some(counting) = update.counting {
            config.counting = counting;
        }

        config
    }

    /// Checks the bounds the throttle relies on.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_requests_per_interval == 0 {
            bail!("max_requests_per_interval must be at least 1");
        }

        if self.interval < Duration::from_secs(1) {
            bail!("interval must be at least one second, got {:?}", self.interval);
        }

        if self.interval.subsec_nanos() != 0 {
            bail!("interval must be a whole number of seconds, got {:?}", self.interval);
        }

        if let StorageConfig::Redis(redis) = &self.storage {
            redis.validate()?;
        }

        Ok(())
    }
}

/// A partial throttling configuration. Fields left as `None` keep their current value
/// when merged into a [`ThrottleConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThrottleConfigUpdate {
    /// New request limit per window.
    pub max_requests_per_interval: Option<u32>,
    /// New window length.
    #[serde(deserialize_with = "deserialize_option_duration")]
    pub interval: Option<Duration>,
    /// New store error policy.
    pub on_store_error: Option<StoreErrorPolicy>,
    /// New counting mode.
    pub counting: Option<CountingMode>,
}

impl ThrottleConfigUpdate {
    /// Sets the request limit per window.
    pub fn max_requests_per_interval(mut self, limit: u32) -> Self {
        self.max_requests_per_interval = Some(limit);
        self
    }

    /// Sets the window length.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Sets the store error policy.
    pub fn on_store_error(mut self, policy: StoreErrorPolicy) -> Self {
        self.on_store_error = Some(policy);
        self
    }

    /// Sets the counting mode.
    pub fn counting(mut self, counting: CountingMode) -> Self {
        self.counting = Some(counting);
        self
    }

    /// Whether merging this update changes nothing.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Decision taken when the counter store fails during a throttling decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreErrorPolicy {
    /// Accept the request. A store outage disables throttling.
    #[default]
    Open,
    /// Reject the request. A store outage rejects all traffic.
    Closed,
}

/// How the hit counter is read and updated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountingMode {
    /// Read, compare, increment and expire as a single store-side operation.
    /// Admits exactly the configured number of requests per window.
    #[default]
    Atomic,
    /// Separate read, increment and expire round-trips. Concurrent requests from the
    /// same client may all observe a count below the limit and be admitted.
    TwoStep,
}

/// Counter store backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Counters kept in process memory. Not shared between instances.
    Memory,
    /// Counters kept in Redis (default).
    Redis(Box<RedisConfig>),
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Redis(Box::default())
    }
}

/// Redis counter store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisConfig {
    /// Host name or address of the Redis server.
    pub host: String,
    /// Port of the Redis server.
    pub port: u16,
    /// Logical database index.
    pub database: u16,
    /// Memory cap applied to the Redis server on connect, with `volatile-lru` eviction.
    pub max_memory_bytes: u64,
    /// Prefix for every counter key.
    pub key_prefix: String,
    /// Upper bound for a single store round-trip.
    #[serde(deserialize_with = "deserialize_duration")]
    pub response_timeout: Duration,
    /// Upper bound for establishing a connection.
    #[serde(deserialize_with = "deserialize_duration")]
    pub connection_timeout: Duration,
    /// Connection pool configuration.
    pub pool: RedisPoolConfig,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            max_memory_bytes: 100 * 1024 * 1024,
            key_prefix: "rethrottle:".to_string(),
            response_timeout: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(5),
            pool: RedisPoolConfig::default(),
        }
    }
}

impl RedisConfig {
    /// The connection URL for this server.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.database)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            bail!("redis port must not be 0");
        }

        if self.max_memory_bytes == 0 {
            bail!("redis max_memory_bytes must be at least 1");
        }

        if self.response_timeout.is_zero() {
            bail!("redis response_timeout must be greater than zero");
        }

        if self.pool.max_size == 0 {
            bail!("redis pool max_size must be at least 1");
        }

        Ok(())
    }
}

/// Redis connection pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisPoolConfig {
    /// Maximum number of connections.
    pub max_size: usize,
    /// Timeout for waiting for a free connection.
    #[serde(deserialize_with = "deserialize_option_duration")]
    pub timeout_wait: Option<Duration>,
    /// Timeout for checking an idle connection before reuse.
    #[serde(deserialize_with = "deserialize_option_duration")]
    pub timeout_recycle: Option<Duration>,
}

impl Default for RedisPoolConfig {
    fn default() -> Self {
        Self {
            max_size: 16,
            timeout_wait: Some(Duration::from_secs(5)),
            timeout_recycle: Some(Duration::from_secs(300)),
        }
    }
}
