use tally_statsd::{CounterMetric, DistributionMetric, GaugeMetric, TimerMetric};

/// Counter metrics for the cluster layer.
pub enum ClusterCounters {
    /// Number of metrics dropped because the queue for a peer was full.
    ///
    /// This metric is tagged with:
    ///  - `node`: The address of the destination.
    QueueOverflow,

    /// Number of queued metrics that absorbed a later metric with the same id.
    ///
    /// This metric is tagged with:
    ///  - `node`: The address of the destination.
    QueueMerged,

    /// Number of metrics dropped because they could not be merged into a queued metric.
    ///
    /// This metric is tagged with:
    ///  - `node`: The address of the destination.
    QueueMergeFailed,

    /// Number of batches delivered to a peer.
    ///
    /// This metric is tagged with:
    ///  - `node`: The address of the destination.
    BatchSent,

    /// Number of failed send attempts that are retried.
    ///
    /// This metric is tagged with:
    ///  - `node`: The address of the destination.
    BatchRetried,

    /// Number of batches dropped after exhausting all send attempts.
    ///
    /// This metric is tagged with:
    ///  - `node`: The address of the destination.
    BatchDropped,

    /// Number of metrics contained in dropped batches.
    ///
    /// This metric is tagged with:
    ///  - `node`: The address of the destination.
    MetricsDropped,

    /// Number of metrics received from peers and accepted into the local worker.
    InboundAccepted,

    /// Number of records received from peers that could not be decoded.
    InboundRejected,
}

impl CounterMetric for ClusterCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::QueueOverflow => "cluster.dispatch.queue_overflow",
            Self::QueueMerged => "cluster.dispatch.queue_merged",
            Self::QueueMergeFailed => "cluster.dispatch.queue_merge_failed",
            Self::BatchSent => "cluster.dispatch.sent",
            Self::BatchRetried => "cluster.dispatch.retried",
            Self::BatchDropped => "cluster.dispatch.dropped",
            Self::MetricsDropped => "cluster.dispatch.metrics_dropped",
            Self::InboundAccepted => "cluster.inbound.accepted",
            Self::InboundRejected => "cluster.inbound.rejected",
        }
    }
}

/// Timer metrics for the cluster layer.
pub enum ClusterTimers {
    /// Time spent in a single send attempt, including failed attempts.
    ///
    /// This metric is tagged with:
    ///  - `node`: The address of the destination.
    ///  - `result`: `ok`, `error` or `timeout`.
    SendDuration,
}

impl TimerMetric for ClusterTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::SendDuration => "cluster.dispatch.send_duration",
        }
    }
}

/// Distribution metrics for the cluster layer.
pub enum ClusterDistributions {
    /// Number of metrics in a batch handed to the transport.
    BatchSize,
}

impl DistributionMetric for ClusterDistributions {
    fn name(&self) -> &'static str {
        match *self {
            Self::BatchSize => "cluster.dispatch.batch_size",
        }
    }
}

/// Gauge metrics for the cluster layer.
pub enum ClusterGauges {
    /// Number of metrics queued for peers and not yet handed to the transport.
    QueuedMetrics,

    /// Number of send tasks currently running, including tasks waiting for a retry.
    InflightSends,
}

impl GaugeMetric for ClusterGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::QueuedMetrics => "cluster.dispatch.queued",
            Self::InflightSends => "cluster.dispatch.inflight",
        }
    }
}
