//! Exponential backoff for retried operations.

use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use serde::{Deserialize, Serialize};

/// Factor applied to the retry interval after every failed attempt.
const DEFAULT_MULTIPLIER: f64 = 1.5;

/// Retry parameters of an operation that may fail transiently.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// The maximum number of attempts including the first one.
    ///
    /// Defaults to `5`. After the last failed attempt the operation is given up.
    pub max_attempts: u32,

    /// The wait time in milliseconds before the first retry.
    ///
    /// Defaults to `500` milliseconds.
    pub initial_interval_ms: u64,

    /// The upper bound in milliseconds for the wait time between two attempts.
    ///
    /// Defaults to `10` seconds.
    pub max_interval_ms: u64,

    /// The time in milliseconds after which a single attempt is cancelled.
    ///
    /// A timed out attempt counts as failed. Defaults to `5` seconds.
    pub attempt_timeout_ms: u64,
}

impl RetryConfig {
    /// Returns the timeout of a single attempt.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Returns a fresh backoff for these parameters.
    pub fn backoff(&self) -> RetryBackoff {
        RetryBackoff::new(
            Duration::from_millis(self.initial_interval_ms),
            Duration::from_millis(self.max_interval_ms),
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval_ms: 500,
            max_interval_ms: 10_000,
            attempt_timeout_ms: 5_000,
        }
    }
}

/// Backoff multiplier (1.5) which is not random.
#[derive(Debug)]
pub struct RetryBackoff {
    backoff: ExponentialBackoff,
    attempt: usize,
}

impl RetryBackoff {
    /// Creates a new [`RetryBackoff`] from the given initial and maximum interval.
    pub fn new(initial_interval: Duration, max_interval: Duration) -> Self {
        let backoff = ExponentialBackoff {
            current_interval: initial_interval,
            initial_interval,
            randomization_factor: 0.0,
            multiplier: DEFAULT_MULTIPLIER,
            max_interval: max_interval.max(initial_interval),
            max_elapsed_time: None,
            ..Default::default()
        };

        Self {
            backoff,
            attempt: 0,
        }
    }

    /// Resets this backoff to its initial state.
    pub fn reset(&mut self) {
        self.backoff.reset();
        self.attempt = 0;
    }

    /// Indicates whether a backoff attempt has started.
    pub fn started(&self) -> bool {
        self.attempt > 0
    }

    /// Returns the number of the retry attempt.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Returns the next backoff duration.
    ///
    /// The first call returns zero, every following call an exponentially growing interval that
    /// is capped at the maximum interval.
    pub fn next_backoff(&mut self) -> Duration {
        let duration = match self.attempt {
            0 => Duration::ZERO,
            _ => self
                .backoff
                .next_backoff()
                .unwrap_or(self.backoff.max_interval),
        };

        self.attempt += 1;
        duration
    }
}
