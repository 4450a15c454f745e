use tally_statsd::{CounterMetric, DistributionMetric, TimerMetric};

/// Counter metrics used by the aggregation pipeline.
pub enum ServerCounters {
    /// Number of samples dropped at the ingestion boundary.
    ///
    /// This metric is tagged with:
    ///  - `reason`: `unknown_entity` or `invalid`.
    SampleDropped,

    /// Number of metrics rejected by a worker.
    ///
    /// Capacity limits are counted by the aggregator itself, this only counts contract violations
    /// such as merges of mismatched kinds.
    ///
    /// This metric is tagged with:
    ///  - `granularity`: The granularity of the worker.
    MetricRejected,

    /// Number of metrics that arrived after their bucket was flushed and are persisted as delta.
    ///
    /// This metric is tagged with:
    ///  - `granularity`: The granularity of the worker.
    LateMetric,

    /// Number of flushed metrics handed to the remote dispatcher because a peer owns them.
    ///
    /// This metric is tagged with:
    ///  - `granularity`: The granularity of the worker.
    MetricDispatched,

    /// Number of failed storage writes that are retried.
    ///
    /// This metric is tagged with:
    ///  - `granularity`: The granularity of the written metrics.
    StorageRetried,

    /// Number of metrics dropped after exhausting all storage write attempts.
    ///
    /// This metric is tagged with:
    ///  - `granularity`: The granularity of the dropped metrics.
    StorageDropped,

    /// Number of metrics written to storage.
    ///
    /// This metric is tagged with:
    ///  - `granularity`: The granularity of the written metrics.
    MetricsPersisted,

    /// Number of history rows removed from storage.
    ///
    /// This metric is tagged with:
    ///  - `granularity`: The granularity of the removed rows.
    HistoryDeleted,

    /// Number of changes of the cluster member list.
    MembershipChanged,
}

impl CounterMetric for ServerCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::SampleDropped => "ingest.dropped",
            Self::MetricRejected => "worker.rejected",
            Self::LateMetric => "worker.late",
            Self::MetricDispatched => "worker.dispatched",
            Self::StorageRetried => "persistence.retried",
            Self::StorageDropped => "persistence.dropped",
            Self::MetricsPersisted => "persistence.written",
            Self::HistoryDeleted => "persistence.history_deleted",
            Self::MembershipChanged => "cluster.membership_changed",
        }
    }
}

/// Timer metrics used by the aggregation pipeline.
pub enum ServerTimers {
    /// Time spent to drain, finalize and forward a worker.
    ///
    /// This metric is tagged with:
    ///  - `granularity`: The granularity of the worker.
    FlushDuration,

    /// Time spent in a single storage write attempt.
    ///
    /// This metric is tagged with:
    ///  - `granularity`: The granularity of the written metrics.
    ///  - `result`: `ok`, `error` or `timeout`.
    StorageWriteDuration,
}

impl TimerMetric for ServerTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::FlushDuration => "worker.flush.duration",
            Self::StorageWriteDuration => "persistence.write.duration",
        }
    }
}

/// Distribution metrics used by the aggregation pipeline.
pub enum ServerDistributions {
    /// Number of metrics produced by a single flush.
    ///
    /// This metric is tagged with:
    ///  - `granularity`: The granularity of the worker.
    FlushedMetrics,
}

impl DistributionMetric for ServerDistributions {
    fn name(&self) -> &'static str {
        match *self {
            Self::FlushedMetrics => "worker.flush.metrics",
        }
    }
}
