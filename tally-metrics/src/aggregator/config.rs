use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::time::Granularity;

/// Default number of lock shards per aggregator.
const DEFAULT_SHARDS: usize = 64;

/// Parameters used by the [`crate::aggregator::Aggregator`].
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// The interval in seconds at which the aggregator is drained.
    ///
    /// Defaults to `25` seconds for minute aggregators. Coarser granularities flush less often, see
    /// [`AggregatorConfig::for_granularity`].
    pub flush_interval: u64,

    /// The number of independently locked shards of the accumulator.
    ///
    /// Unrelated metrics only contend when they hash to the same shard. Defaults to `64`.
    pub shards: usize,

    /// Maximum number of distinct metrics held between two drains.
    ///
    /// New metrics beyond this limit are dropped, merges into existing metrics are always
    /// admitted. Defaults to `None`, i.e. no limit.
    pub max_total_entries: Option<usize>,

    /// Maximum number of distinct metrics with the same name held between two drains.
    ///
    /// Protects the aggregator from a single metric name with exploding entity cardinality.
    /// Defaults to `None`, i.e. no limit.
    pub max_entries_per_metric: Option<usize>,
}

impl AggregatorConfig {
    /// Returns the default configuration for an aggregator at the given granularity.
    pub fn for_granularity(granularity: Granularity) -> Self {
        let flush_interval = match granularity {
            Granularity::Minute => 25,
            Granularity::Hour => 60,
            Granularity::Day => 120,
            Granularity::Month => 300,
        };

        Self {
            flush_interval,
            ..Default::default()
        }
    }

    /// Returns the flush interval as [`Duration`].
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval.max(1))
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            flush_interval: 25,
            shards: DEFAULT_SHARDS,
            max_total_entries: None,
            max_entries_per_metric: None,
        }
    }
}
