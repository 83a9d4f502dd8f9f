//! Configuration options for a distributed mutex

use std::time::Duration;

use crate::config::LockClientConfig;

/// Controls lease length and how long a single store round-trip may take.
#[derive(Debug, Clone)]
pub struct MutexConfig {
    /// Lease duration (TTL of the lock key).
    ///
    /// Default 5000ms
    pub lease: Duration,
    /// Upper bound for a single store round-trip. Distinct from the overall acquisition deadline.
    ///
    /// Default 57ms
    pub attempt_timeout: Duration,
    /// Fraction of the lease reserved for clock drift between this process and the store.
    /// A fixed 2ms is always added on top.
    ///
    /// Default 0.01
    pub drift_factor: f64,
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_millis(5000),
            attempt_timeout: Duration::from_millis(57),
            drift_factor: 0.01,
        }
    }
}

impl MutexConfig {
    /// Portion of the lease that is not trusted as held.
    pub fn drift(&self) -> Duration {
        let factor = if self.drift_factor.is_finite() {
            self.drift_factor.clamp(0.0, 1.0)
        } else {
            0.0
        };

        self.lease.mul_f64(factor) + Duration::from_millis(2)
    }
}

impl From<&LockClientConfig> for MutexConfig {
    fn from(value: &LockClientConfig) -> Self {
        Self {
            lease: value.lease,
            attempt_timeout: value.attempt_timeout,
            drift_factor: value.drift_factor,
        }
    }
}
