//! Fixed-window throttle decision engine.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use config::{CountingMode, StoreErrorPolicy, ThrottleConfig, ThrottleConfigUpdate};

use crate::error::ThrottleError;
use crate::storage::{CounterStore, Storage, StorageError};
use crate::ClientKey;

/// Outcome of a throttling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The client is within its budget; the request continues.
    Accept,
    /// The client exhausted its budget for the current window.
    Reject,
}

impl Decision {
    /// Whether the request may continue.
    pub fn is_accepted(self) -> bool {
        matches!(self, Decision::Accept)
    }
}

impl From<StoreErrorPolicy> for Decision {
    fn from(policy: StoreErrorPolicy) -> Self {
        match policy {
            StoreErrorPolicy::Open => Decision::Accept,
            StoreErrorPolicy::Closed => Decision::Reject,
        }
    }
}

/// Per-client fixed-window throttle over a counter store.
///
/// A client may make `max_requests_per_interval` requests; each accepted request counts one
/// hit and moves the end of the client's window `interval` past now. Requests over the
/// limit are rejected and neither counted nor extend the window.
///
/// The throttle is shared between requests behind an `Arc`. Configuration is read as a
/// snapshot at the start of each decision, so [`Throttle::configure`] never waits for
/// in-flight decisions and they never observe a half-applied update.
pub struct Throttle<S = Storage> {
    config: RwLock<Arc<ThrottleConfig>>,
    store: S,
}

impl Throttle<Storage> {
    /// Create a throttle with the storage backend named in the configuration.
    ///
    /// The store is connected before this returns, so an unreachable Redis fails here and
    /// not on the first request.
    pub async fn connect(config: ThrottleConfig) -> Result<Self, ThrottleError> {
        validate(&config)?;

        let store = Storage::new(&config.storage).await?;

        Self::with_store(config, store)
    }
}

impl<S> Throttle<S>
where
    S: CounterStore,
{
    /// Create a throttle over an existing store. The storage section of `config` is ignored.
    pub fn with_store(config: ThrottleConfig, store: S) -> Result<Self, ThrottleError> {
        validate(&config)?;

        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            store,
        })
    }

    /// The configuration decisions currently use.
    pub fn config(&self) -> Arc<ThrottleConfig> {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// The underlying counter store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Merge `update` into the current configuration.
    ///
    /// Fields missing from the update keep their value. Decisions started after this returns
    /// use the new configuration. An invalid result is rejected and nothing changes. The
    /// store connection is not affected.
    pub fn configure(&self, update: ThrottleConfigUpdate) -> Result<(), ThrottleError> {
        if update.is_empty() {
            return Ok(());
        }

        let mut current = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let merged = current.merged(&update);

        validate(&merged)?;

        log::debug!(
            "Throttle reconfigured: {} requests per {:?}, store errors {:?}, counting {:?}",
            merged.max_requests_per_interval,
            merged.interval,
            merged.on_store_error,
            merged.counting,
        );

        *current = Arc::new(merged);

        Ok(())
    }

    /// Count a request from `key` and decide whether it may continue.
    ///
    /// Never fails: when the store cannot be read the configured store error policy decides,
    /// and a failed write after an admitting read is logged and the request accepted.
    pub async fn decide(&self, key: &ClientKey) -> Decision {
        let config = self.config();
        let limit = config.max_requests_per_interval;

        let admitted = match config.counting {
            CountingMode::Atomic => self.decide_atomic(key, limit, config.interval).await,
            CountingMode::TwoStep => self.decide_two_step(key, limit, config.interval).await,
        };

        match admitted {
            Ok(true) => {
                log::debug!("Request from {key} accepted");
                Decision::Accept
            }
            Ok(false) => {
                log::debug!("Request from {key} rejected: limit of {limit} per {:?} reached", config.interval);
                Decision::Reject
            }
            Err(e) => {
                let decision = Decision::from(config.on_store_error);
                log::error!("Counter store failed for {key}, request decided as {decision:?}: {e}");
                decision
            }
        }
    }

    async fn decide_atomic(&self, key: &ClientKey, limit: u32, interval: Duration) -> Result<bool, StorageError> {
        let result = self.store.check_and_increment(key, limit, interval).await?;
        Ok(result.allowed)
    }

    async fn decide_two_step(&self, key: &ClientKey, limit: u32, interval: Duration) -> Result<bool, StorageError> {
        let hits = self.store.get_count(key).await?;

        if hits >= u64::from(limit) {
            return Ok(false);
        }

        // Other requests from the same client may have read the same count in the meantime.
        if let Err(e) = self.store.increment(key).await {
            log::error!("Failed to count request from {key}: {e}");
        }

        if let Err(e) = self.store.refresh_expiry(key, interval).await {
            log::error!("Failed to extend the window of {key}: {e}");
        }

        Ok(true)
    }
}

fn validate(config: &ThrottleConfig) -> Result<(), ThrottleError> {
    config
        .validate()
        .map_err(|e| ThrottleError::InvalidConfig(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use config::{StorageConfig, ThrottleConfigUpdate};
    use futures::future::join_all;

    use super::*;
    use crate::storage::{HitResult, InMemoryStorage};

    fn config(limit: u32, interval_secs: u64) -> ThrottleConfig {
        ThrottleConfig {
            max_requests_per_interval: limit,
            interval: Duration::from_secs(interval_secs),
            storage: StorageConfig::Memory,
            ..Default::default()
        }
    }

    fn throttle(config: ThrottleConfig) -> Throttle<InMemoryStorage> {
        Throttle::with_store(config, InMemoryStorage::new()).unwrap()
    }

    async fn decide_n(throttle: &Throttle<impl CounterStore>, key: &ClientKey, n: usize) -> Vec<Decision> {
        let mut decisions = Vec::with_capacity(n);

        for _ in 0..n {
            decisions.push(throttle.decide(key).await);
        }

        decisions
    }

    /// A store that is down, or comes back up when told to.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryStorage,
        down: AtomicBool,
        writes_down: AtomicBool,
    }

    impl FlakyStore {
        fn down() -> Self {
            let store = Self::default();
            store.down.store(true, Ordering::SeqCst);
            store
        }

        fn check(&self, flag: &AtomicBool) -> Result<(), StorageError> {
            if flag.load(Ordering::SeqCst) {
                Err(StorageError::Connection("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    impl CounterStore for FlakyStore {
        async fn get_count(&self, key: &ClientKey) -> Result<u64, StorageError> {
            self.check(&self.down)?;
            self.inner.get_count(key).await
        }

        async fn increment(&self, key: &ClientKey) -> Result<u64, StorageError> {
            self.check(&self.down)?;
            self.check(&self.writes_down)?;
            self.inner.increment(key).await
        }

        async fn refresh_expiry(&self, key: &ClientKey, ttl: Duration) -> Result<(), StorageError> {
            self.check(&self.down)?;
            self.check(&self.writes_down)?;
            self.inner.refresh_expiry(key, ttl).await
        }

        async fn check_and_increment(
            &self,
            key: &ClientKey,
            limit: u32,
            ttl: Duration,
        ) -> Result<HitResult, StorageError> {
            self.check(&self.down)?;
            self.inner.check_and_increment(key, limit, ttl).await
        }
    }

    /// Yields to the scheduler between reading a count and returning it, like a network
    /// round-trip would.
    #[derive(Default)]
    struct SlowReadStore {
        inner: InMemoryStorage,
    }

    impl CounterStore for SlowReadStore {
        async fn get_count(&self, key: &ClientKey) -> Result<u64, StorageError> {
            let hits = self.inner.get_count(key).await?;
            tokio::task::yield_now().await;
            Ok(hits)
        }

        async fn increment(&self, key: &ClientKey) -> Result<u64, StorageError> {
            self.inner.increment(key).await
        }

        async fn refresh_expiry(&self, key: &ClientKey, ttl: Duration) -> Result<(), StorageError> {
            self.inner.refresh_expiry(key, ttl).await
        }

        async fn check_and_increment(
            &self,
            key: &ClientKey,
            limit: u32,
            ttl: Duration,
        ) -> Result<HitResult, StorageError> {
            self.inner.check_and_increment(key, limit, ttl).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn accepts_up_to_the_limit() {
        let throttle = throttle(config(3, 1));
        let key = ClientKey::new("10.0.0.1");

        let decisions = decide_n(&throttle, &key, 5).await;

        assert_eq!(
            decisions,
            [
                Decision::Accept,
                Decision::Accept,
                Decision::Accept,
                Decision::Reject,
                Decision::Reject
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_interval() {
        for counting in [CountingMode::Atomic, CountingMode::TwoStep] {
            let throttle = throttle(ThrottleConfig {
                counting,
                ..config(1, 10)
            });
            let key = ClientKey::new("10.0.0.1");

            let decisions = decide_n(&throttle, &key, 3).await;
            assert_eq!(decisions, [Decision::Accept, Decision::Reject, Decision::Reject]);

            tokio::time::advance(Duration::from_secs(10)).await;

            assert_eq!(throttle.decide(&key).await, Decision::Accept, "{counting:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_of_one_client_does_not_affect_another() {
        let throttle = throttle(config(1, 10));
        let a = ClientKey::new("10.0.0.1");
        let b = ClientKey::new("10.0.0.2");

        assert_eq!(throttle.decide(&a).await, Decision::Accept);
        assert_eq!(throttle.decide(&a).await, Decision::Reject);
        assert_eq!(throttle.decide(&b).await, Decision::Accept);
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_requests_extend_the_window() {
        let throttle = throttle(config(2, 10));
        let key = ClientKey::new("10.0.0.1");

        assert_eq!(throttle.decide(&key).await, Decision::Accept);

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(throttle.decide(&key).await, Decision::Accept);

        // The first hit is 12s old, but the second one moved the window end to t=18s.
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(throttle.decide(&key).await, Decision::Reject);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(throttle.decide(&key).await, Decision::Accept);
    }

    #[tokio::test]
    async fn empty_update_changes_nothing() {
        let throttle = throttle(config(4, 2));
        let before = throttle.config();

        throttle.configure(ThrottleConfigUpdate::default()).unwrap();

        assert!(Arc::ptr_eq(&before, &throttle.config()));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_update_changes_only_the_limit() {
        let throttle = throttle(ThrottleConfig {
            on_store_error: StoreErrorPolicy::Closed,
            ..config(1, 10)
        });
        let key = ClientKey::new("10.0.0.1");

        assert_eq!(decide_n(&throttle, &key, 2).await, [Decision::Accept, Decision::Reject]);

        throttle
            .configure(ThrottleConfigUpdate::default().max_requests_per_interval(5))
            .unwrap();

        let config = throttle.config();
        assert_eq!(config.max_requests_per_interval, 5);
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.on_store_error, StoreErrorPolicy::Closed);

        // The existing counter is kept; the new limit applies to it.
        assert_eq!(
            decide_n(&throttle, &key, 5).await,
            [
                Decision::Accept,
                Decision::Accept,
                Decision::Accept,
                Decision::Accept,
                Decision::Reject
            ]
        );
    }

    #[tokio::test]
    async fn invalid_update_is_rejected() {
        let throttle = throttle(config(4, 2));

        let result = throttle.configure(ThrottleConfigUpdate::default().max_requests_per_interval(0));

        assert!(matches!(result, Err(ThrottleError::InvalidConfig(_))));
        assert_eq!(throttle.config().max_requests_per_interval, 4);
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let result = Throttle::with_store(config(0, 1), InMemoryStorage::new());

        assert!(matches!(result, Err(ThrottleError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn store_outage_fails_open_by_default() {
        for counting in [CountingMode::Atomic, CountingMode::TwoStep] {
            let throttle = Throttle::with_store(ThrottleConfig { counting, ..config(1, 10) }, FlakyStore::down()).unwrap();
            let key = ClientKey::new("10.0.0.1");

            let decisions = decide_n(&throttle, &key, 3).await;

            assert_eq!(decisions, [Decision::Accept; 3], "{counting:?}");
        }
    }

    #[tokio::test]
    async fn store_outage_fails_closed_when_configured() {
        let throttle = Throttle::with_store(
            ThrottleConfig {
                on_store_error: StoreErrorPolicy::Closed,
                ..config(10, 10)
            },
            FlakyStore::down(),
        )
        .unwrap();

        assert_eq!(throttle.decide(&ClientKey::new("10.0.0.1")).await, Decision::Reject);
    }

    #[tokio::test]
    async fn throttling_resumes_when_store_recovers() {
        let throttle = Throttle::with_store(config(1, 10), FlakyStore::down()).unwrap();
        let key = ClientKey::new("10.0.0.1");

        assert_eq!(decide_n(&throttle, &key, 2).await, [Decision::Accept, Decision::Accept]);

        throttle.store().down.store(false, Ordering::SeqCst);

        assert_eq!(decide_n(&throttle, &key, 2).await, [Decision::Accept, Decision::Reject]);
    }

    #[tokio::test]
    async fn failed_write_still_accepts_in_two_step_mode() {
        let store = FlakyStore::default();
        store.writes_down.store(true, Ordering::SeqCst);

        let throttle = Throttle::with_store(
            ThrottleConfig {
                counting: CountingMode::TwoStep,
                on_store_error: StoreErrorPolicy::Closed,
                ..config(1, 10)
            },
            store,
        )
        .unwrap();
        let key = ClientKey::new("10.0.0.1");

        // The hit is never counted, so the client is never limited.
        assert_eq!(decide_n(&throttle, &key, 3).await, [Decision::Accept; 3]);
    }

    #[tokio::test]
    async fn two_step_counting_admits_concurrent_burst_over_the_limit() {
        let throttle = Throttle::with_store(
            ThrottleConfig {
                counting: CountingMode::TwoStep,
                ..config(3, 10)
            },
            SlowReadStore::default(),
        )
        .unwrap();
        let key = ClientKey::new("10.0.0.1");

        let decisions = join_all((0..10).map(|_| throttle.decide(&key))).await;
        let accepted = decisions.iter().filter(|d| d.is_accepted()).count();

        // Every request read a count of zero before any of them was counted.
        assert_eq!(accepted, 10);
        assert_eq!(throttle.store().inner.get_count(&key).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn atomic_counting_admits_exactly_the_limit_under_concurrency() {
        let throttle = Throttle::with_store(config(3, 10), SlowReadStore::default()).unwrap();
        let key = ClientKey::new("10.0.0.1");

        let decisions = join_all((0..10).map(|_| throttle.decide(&key))).await;
        let accepted = decisions.iter().filter(|d| d.is_accepted()).count();

        assert_eq!(accepted, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn atomic_counting_admits_exactly_the_limit_across_threads() {
        let throttle = Arc::new(throttle(config(25, 60)));
        let key = ClientKey::new("10.0.0.1");

        let tasks = (0..100).map(|_| {
            let throttle = throttle.clone();
            let key = key.clone();
            tokio::spawn(async move { throttle.decide(&key).await })
        });

        let decisions = join_all(tasks).await;
        let accepted = decisions
            .into_iter()
            .filter(|d| matches!(d, Ok(Decision::Accept)))
            .count();

        assert_eq!(accepted, 25);
    }
}
