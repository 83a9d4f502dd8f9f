use std::time::Duration;

use crate::{backoff::BackoffConfig, mutex::MutexConfig, store::StoreConfig};

#[derive(Debug, Clone)]
pub struct LockClientConfig {
    /// Redis endpoint holding the lock keys.
    ///
    /// Default redis://0.0.0.0:6379
    pub redis_url: String,
    /// Timeout to establish the initial connection.
    ///
    /// Default 5s
    pub connection_timeout: Duration,
    /// How long an acquired lock stays valid without being extended.
    ///
    /// Default 5000ms
    pub lease: Duration,
    /// Timeout for a single store round-trip.
    ///
    /// Default 57ms
    pub attempt_timeout: Duration,
    /// Fraction of the lease reserved for clock drift.
    ///
    /// Default 0.01
    pub drift_factor: f64,
    /// First wait between acquisition attempts.
    ///
    /// Default 7ms
    pub initial_interval: Duration,
    /// Jitter applied to every wait, as a fraction of the wait.
    ///
    /// Default 0.5
    pub randomization_factor: f64,
    /// Growth of the wait after each failed attempt.
    ///
    /// Default 1.5
    pub multiplier: f64,
    /// Ceiling for the wait between attempts.
    ///
    /// Default 6s
    pub max_interval: Duration,
    /// Give up acquiring after this long. If None, acquisition retries until cancelled.
    ///
    /// Default 15s
    pub max_elapsed_time: Option<Duration>,
}

impl Default for LockClientConfig {
    fn default() -> Self {
        let store = StoreConfig::default();
        let mutex = MutexConfig::default();

        Self {
            redis_url: store.url,
            connection_timeout: store.connection_timeout,
            lease: mutex.lease,
            attempt_timeout: mutex.attempt_timeout,
            drift_factor: mutex.drift_factor,
            initial_interval: Duration::from_millis(7),
            randomization_factor: 0.5,
            multiplier: 1.5,
            max_interval: Duration::from_secs(6),
            max_elapsed_time: Some(Duration::from_secs(15)),
        }
    }
}

impl From<&LockClientConfig> for BackoffConfig {
    fn from(value: &LockClientConfig) -> Self {
        Self {
            initial_interval: value.initial_interval,
            randomization_factor: value.randomization_factor,
            multiplier: value.multiplier,
            max_interval: value.max_interval,
            max_elapsed_time: value.max_elapsed_time,
        }
    }
}
