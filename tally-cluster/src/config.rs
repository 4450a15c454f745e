use std::time::Duration;

use serde::{Deserialize, Serialize};
use tally_common::retry::RetryConfig;

/// Parameters of the [`RemoteDispatcherService`](crate::RemoteDispatcherService).
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// The interval in milliseconds at which pending batches are sent.
    ///
    /// Defaults to `100` milliseconds.
    pub batch_interval_ms: u64,

    /// The number of metrics after which a batch is sent without waiting for the interval.
    ///
    /// Defaults to `500`.
    pub max_batch_size: usize,

    /// The maximum number of metrics queued per destination.
    ///
    /// Queued metrics with the same id are merged and count once. When the queue is full, the
    /// newest entry of the metric name with the most queued entries is shed. Defaults to `10000`.
    pub max_queue_size: usize,

    /// Timeouts and retries of send attempts.
    pub retry: RetryConfig,
}

impl DispatchConfig {
    /// Returns the batch interval as [`Duration`].
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms.max(1))
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: 100,
            max_batch_size: 500,
            max_queue_size: 10_000,
            retry: RetryConfig::default(),
        }
    }
}
