use tally_statsd::{CounterMetric, DistributionMetric, GaugeMetric, TimerMetric};

/// Counter metrics for Tally Metrics.
pub enum MetricCounters {
    /// Incremented every time a metric is merged into an existing entry.
    ///
    /// This metric is tagged with:
    ///  - `aggregator`: The name of the aggregator.
    MergeHit,

    /// Incremented every time a new entry is created in an aggregator.
    ///
    /// This metric is tagged with:
    ///  - `aggregator`: The name of the aggregator.
    MergeMiss,

    /// Incremented for every metric rejected because its kind did not match the stored entry.
    ///
    /// This metric is tagged with:
    ///  - `aggregator`: The name of the aggregator.
    MergeFailed,

    /// Incremented for every metric that arrived after its time bucket was drained.
    ///
    /// This metric is tagged with:
    ///  - `aggregator`: The name of the aggregator.
    LateArrival,

    /// Incremented for every new metric dropped by a capacity limit.
    ///
    /// This metric is tagged with:
    ///  - `aggregator`: The name of the aggregator.
    ///  - `limit`: Either `total` or `per_metric`.
    EntriesDropped,
}

impl CounterMetric for MetricCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::MergeHit => "metrics.entries.merge.hit",
            Self::MergeMiss => "metrics.entries.merge.miss",
            Self::MergeFailed => "metrics.entries.merge.failed",
            Self::LateArrival => "metrics.entries.late",
            Self::EntriesDropped => "metrics.entries.dropped",
        }
    }
}

/// Timer metrics for Tally Metrics.
pub enum MetricTimers {
    /// Time spent swapping out the accumulator and waiting for in-flight writers.
    ///
    /// This metric is tagged with:
    ///  - `aggregator`: The name of the aggregator.
    DrainDuration,
}

impl TimerMetric for MetricTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::DrainDuration => "metrics.drain.duration",
        }
    }
}

/// Distribution metrics for Tally Metrics.
pub enum MetricDistributions {
    /// The number of entries returned by a single drain.
    ///
    /// This metric is tagged with:
    ///  - `aggregator`: The name of the aggregator.
    EntriesDrained,
}

impl DistributionMetric for MetricDistributions {
    fn name(&self) -> &'static str {
        match *self {
            Self::EntriesDrained => "metrics.drain.entries",
        }
    }
}

/// Gauge metrics for Tally Metrics.
pub enum MetricGauges {
    /// The number of entries currently held by an aggregator.
    ///
    /// Emitted after every drain, reflecting entries accepted while the drain was running.
    ///
    /// This metric is tagged with:
    ///  - `aggregator`: The name of the aggregator.
    Entries,

    /// The watermark of an aggregator, the last time bucket considered complete.
    ///
    /// This metric is tagged with:
    ///  - `aggregator`: The name of the aggregator.
    Watermark,
}

impl GaugeMetric for MetricGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::Entries => "metrics.entries",
            Self::Watermark => "metrics.watermark",
        }
    }
}
