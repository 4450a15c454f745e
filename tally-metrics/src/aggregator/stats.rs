use std::sync::atomic::{AtomicU64, Ordering};

/// Counters collected by an accumulator between two drains.
#[derive(Debug, Default)]
pub struct Counters {
    /// Amount of metrics created.
    pub created: AtomicU64,
    /// Amount of merges into existing metrics.
    pub merges: AtomicU64,
    /// Amount of metrics rejected because of mismatched kinds or precisions.
    pub merge_failures: AtomicU64,
    /// Amount of new metrics dropped by the total limit.
    pub dropped_total: AtomicU64,
    /// Amount of new metrics dropped by the per-metric limit.
    pub dropped_per_metric: AtomicU64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a point in time snapshot of all counters.
    pub fn snapshot(&self) -> Snapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        Snapshot {
            created: load(&self.created),
            merges: load(&self.merges),
            merge_failures: load(&self.merge_failures),
            dropped_total: load(&self.dropped_total),
            dropped_per_metric: load(&self.dropped_per_metric),
        }
    }
}

/// Stats of one drained accumulator.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Snapshot {
    /// See [`Counters::created`].
    pub created: u64,
    /// See [`Counters::merges`].
    pub merges: u64,
    /// See [`Counters::merge_failures`].
    pub merge_failures: u64,
    /// See [`Counters::dropped_total`].
    pub dropped_total: u64,
    /// See [`Counters::dropped_per_metric`].
    pub dropped_per_metric: u64,
}
