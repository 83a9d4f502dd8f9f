//! Exponential backoff with bounded jitter and an elapsed-time budget

use std::time::Duration;

use rand::{rngs::StdRng, Rng};
use tokio::time::Instant;

/// Parameters for an [`ExponentialBackoff`].
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// First interval handed out after a failure.
    ///
    /// Default 500ms
    pub initial_interval: Duration,
    /// Each interval is randomized within `interval * [1 - r, 1 + r]`. Clamped into `[0, 1]`.
    ///
    /// Default 0.5
    pub randomization_factor: f64,
    /// Growth factor applied to the interval after every call. Values below 1 shrink the interval.
    ///
    /// Default 1.5
    pub multiplier: f64,
    /// Ceiling for the (pre-jitter) interval.
    ///
    /// Default 60s
    pub max_interval: Duration,
    /// Total time budget measured from the last reset.
    /// If None or zero, the backoff never stops.
    ///
    /// Default 15min
    pub max_elapsed_time: Option<Duration>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            randomization_factor: 0.5,
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Some(Duration::from_secs(15 * 60)),
        }
    }
}

/// Converts seconds to a duration, saturating instead of panicking.
///
/// Negative and NaN inputs become zero.
fn saturating_secs(secs: f64) -> Duration {
    if !(secs > 0.0) {
        return Duration::ZERO;
    }

    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Hands out increasing wait durations for retrying a fallible operation.
///
/// The random source is owned by the backoff so that a seeded generator produces a reproducible sequence.
#[derive(Debug)]
pub struct ExponentialBackoff<R = StdRng> {
    config: BackoffConfig,
    current_interval: Duration,
    start: Instant,
    rng: R,
}

impl<R: Rng> ExponentialBackoff<R> {
    pub fn new(mut config: BackoffConfig, rng: R) -> Self {
        config.randomization_factor = if config.randomization_factor.is_finite() {
            config.randomization_factor.clamp(0.0, 1.0)
        } else {
            0.0
        };

        Self {
            current_interval: config.initial_interval.min(config.max_interval),
            config,
            start: Instant::now(),
            rng,
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Time since creation or the last [`reset`](Self::reset).
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Restart from the initial interval and zero the elapsed time. The configuration is unchanged.
    pub fn reset(&mut self) {
        self.current_interval = self.config.initial_interval.min(self.config.max_interval);
        self.start = Instant::now();
    }

    /// Returns the next wait duration, or None once the elapsed-time budget would be exceeded.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let elapsed = self.elapsed();
        let next = self.randomized_interval();

        self.increment_interval();

        match self.config.max_elapsed_time {
            Some(budget) if !budget.is_zero() && elapsed.saturating_add(next) > budget => None,
            _ => Some(next),
        }
    }

    fn randomized_interval(&mut self) -> Duration {
        let current = self.current_interval.as_secs_f64();
        let delta = self.config.randomization_factor * current;

        if delta == 0.0 {
            return self.current_interval;
        }

        saturating_secs(self.rng.gen_range((current - delta)..=(current + delta)))
    }

    fn increment_interval(&mut self) {
        let next = saturating_secs(self.current_interval.as_secs_f64() * self.config.multiplier);

        self.current_interval = std::cmp::min(next, self.config.max_interval);
    }
}
