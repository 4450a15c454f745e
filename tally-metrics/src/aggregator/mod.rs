//! Core functionality of metrics aggregation.
//!
//! An [`Aggregator`] accumulates metrics of a single granularity in memory. Producers call
//! [`Aggregator::accept`] concurrently from any thread, while a flush task periodically calls
//! [`Aggregator::drain`] to take out everything accepted so far.
//!
//! The accumulator is split into independently locked shards keyed by the metric id, so unrelated
//! metrics do not contend. Draining swaps the whole accumulator for an empty one and then waits for
//! writers that still hold a reference to the old accumulator. Every accepted metric is therefore
//! returned by exactly one drain.
//!
//! A drain publishes its watermark before swapping the accumulator, and `accept` compares against
//! the watermark only after it has loaded the accumulator. A metric for a completed bucket that
//! lands in the fresh accumulator is therefore always reported as [`Accepted::Late`]. A metric
//! that still reached the old accumulator is returned by the drain in progress.

use std::hash::BuildHasher;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use arc_swap::ArcSwap;
use hashbrown::HashMap;
use hashbrown::hash_map::Entry;
use parking_lot::Mutex;
use tally_common::time::UnixTimestamp;
use tally_statsd::metric;

use crate::protocol::{MetricId, MetricName};
use crate::statsd::{MetricCounters, MetricDistributions, MetricGauges, MetricTimers};
use crate::time::{Granularity, TimeBucket};
use crate::value::MetricKind;
use crate::Metric;

mod config;
mod stats;

pub use self::config::*;
use self::stats::{Counters, Snapshot};

/// Any error that may occur during aggregation.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum AggregateMetricsError {
    /// Attempted to merge two metrics with different keys.
    #[error("cannot merge metric {found} into {expected}")]
    MismatchedIds {
        /// The id of the metric merged into.
        expected: MetricId,
        /// The id of the offending metric.
        found: MetricId,
    },
    /// Attempted to merge two metrics of different kinds.
    #[error("found incompatible metric kinds, expected {expected} but got {found}")]
    InvalidTypes {
        /// The kind of the stored metric.
        expected: MetricKind,
        /// The kind of the offending metric.
        found: MetricKind,
    },
    /// Attempted to merge two values of the same kind with incompatible parameters.
    #[error("found incompatible {0} values")]
    IncompatibleValues(MetricKind),
    /// The metric has a granularity this operation does not support.
    #[error("cannot convert {from} metric to {to}")]
    InvalidGranularity {
        /// The granularity of the metric.
        from: Granularity,
        /// The requested or expected granularity.
        to: Granularity,
    },
    /// The aggregator holds too many distinct metrics.
    #[error("total metrics limit exceeded")]
    TotalLimitExceeded,
    /// The aggregator holds too many distinct metrics with the same name.
    #[error("metrics limit exceeded for {0}")]
    MetricLimitExceeded(MetricName),
}

/// The outcome of [`Aggregator::accept`].
#[derive(Debug, Eq, PartialEq)]
pub enum Accepted {
    /// The metric was stored as a new entry.
    Created,
    /// The metric was merged into an existing entry.
    Merged,
    /// The time bucket of the metric was already drained.
    ///
    /// The metric is handed back and must be persisted as a delta by the caller.
    Late(Metric),
}

/// An aggregator for metrics of a single granularity.
///
/// See the [module level documentation](self) for more information.
#[derive(Debug)]
pub struct Aggregator {
    name: String,
    granularity: Granularity,
    config: AggregatorConfig,
    current: ArcSwap<Accumulator>,
    /// The encoded last bucket that had ended at the time of the latest drain, `0` if none.
    watermark: AtomicU64,
    drain_lock: Mutex<()>,
}

impl Aggregator {
    /// Creates a new named aggregator for the given granularity.
    pub fn named(name: String, granularity: Granularity, config: AggregatorConfig) -> Self {
        let current = ArcSwap::from_pointee(Accumulator::new(config.shards));

        Self {
            name,
            granularity,
            config,
            current,
            watermark: AtomicU64::new(0),
            drain_lock: Mutex::new(()),
        }
    }

    /// Returns the name of the aggregator.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the granularity of metrics accepted by this aggregator.
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Returns the configuration of this aggregator.
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Returns the number of distinct metrics currently held.
    pub fn len(&self) -> usize {
        self.current.load().entries.load(Ordering::Relaxed)
    }

    /// Returns `true` if the aggregator holds no metrics.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the last bucket that was considered complete by a drain.
    pub fn watermark(&self) -> Option<TimeBucket> {
        match self.watermark.load(Ordering::Acquire) {
            0 => None,
            value => TimeBucket::parse(value).ok(),
        }
    }

    /// Accepts a metric into the aggregator.
    ///
    /// Creates a new entry if no metric with the same key is held, otherwise merges into the
    /// existing entry. Metrics for buckets that were already drained are handed back as
    /// [`Accepted::Late`].
    pub fn accept(&self, metric: Metric) -> Result<Accepted, AggregateMetricsError> {
        if metric.granularity() != self.granularity {
            return Err(AggregateMetricsError::InvalidGranularity {
                from: metric.granularity(),
                to: self.granularity,
            });
        }

        // Holding the `Arc` marks this call as in-flight for a concurrent drain.
        let accumulator = self.current.load_full();

        let watermark = self.watermark.load(Ordering::SeqCst);
        if metric.time_bucket().as_u64() <= watermark {
            metric!(counter(MetricCounters::LateArrival) += 1, aggregator = &self.name);
            return Ok(Accepted::Late(metric));
        }

        let result = accumulator.insert(metric, &self.config);

        match &result {
            Ok(Accepted::Created) => {
                metric!(counter(MetricCounters::MergeMiss) += 1, aggregator = &self.name);
            }
            Ok(_) => {
                metric!(counter(MetricCounters::MergeHit) += 1, aggregator = &self.name);
            }
            Err(AggregateMetricsError::TotalLimitExceeded) => {
                metric!(
                    counter(MetricCounters::EntriesDropped) += 1,
                    aggregator = &self.name,
                    limit = "total",
                );
            }
            Err(AggregateMetricsError::MetricLimitExceeded(_)) => {
                metric!(
                    counter(MetricCounters::EntriesDropped) += 1,
                    aggregator = &self.name,
                    limit = "per_metric",
                );
            }
            Err(_) => {
                metric!(counter(MetricCounters::MergeFailed) += 1, aggregator = &self.name);
            }
        }

        result
    }

    /// Takes all metrics accepted so far and resets the aggregator.
    ///
    /// The watermark advances to the last bucket that had fully ended at `now`. Concurrent drains
    /// are serialized.
    pub fn drain(&self, now: UnixTimestamp) -> Vec<Metric> {
        let _guard = self.drain_lock.lock();
        let started = Instant::now();

        if let Some(watermark) = TimeBucket::last_completed(now, self.granularity) {
            self.watermark
                .fetch_max(watermark.as_u64(), Ordering::SeqCst);
        }

        let previous = self
            .current
            .swap(Arc::new(Accumulator::new(self.config.shards)));

        let accumulator = wait_for_writers(previous);
        metric!(
            timer(MetricTimers::DrainDuration) = started.elapsed(),
            aggregator = &self.name,
        );

        let stats = accumulator.counters.snapshot();
        let metrics = accumulator.into_metrics();

        tally_log::trace!(
            aggregator = %self.name,
            entries = metrics.len(),
            created = stats.created,
            merges = stats.merges,
            "drained aggregator"
        );
        self.emit_stats(&stats, metrics.len());

        metrics
    }

    fn emit_stats(&self, stats: &Snapshot, drained: usize) {
        if stats.merge_failures > 0 || stats.dropped_total > 0 || stats.dropped_per_metric > 0 {
            tally_log::warn!(
                aggregator = %self.name,
                merge_failures = stats.merge_failures,
                dropped_total = stats.dropped_total,
                dropped_per_metric = stats.dropped_per_metric,
                "aggregator discarded metrics since last drain"
            );
        }

        metric!(
            distribution(MetricDistributions::EntriesDrained) = drained as u64,
            aggregator = &self.name,
        );
        metric!(
            gauge(MetricGauges::Entries) = self.len() as u64,
            aggregator = &self.name,
        );
        metric!(
            gauge(MetricGauges::Watermark) = self.watermark.load(Ordering::Relaxed),
            aggregator = &self.name,
        );
    }
}

/// Waits until no writer holds a reference to the accumulator and takes ownership of it.
///
/// Writers only hold the reference for the duration of a single insert.
fn wait_for_writers(mut accumulator: Arc<Accumulator>) -> Accumulator {
    let mut spins = 0u32;
    loop {
        match Arc::try_unwrap(accumulator) {
            Ok(inner) => return inner,
            Err(shared) => {
                accumulator = shared;
                if spins < 64 {
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
                spins = spins.saturating_add(1);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Shard {
    entries: HashMap<MetricId, Metric>,
}

/// The mutable state of an aggregator between two drains.
#[derive(Debug)]
struct Accumulator {
    shards: Box<[Mutex<Shard>]>,
    hasher: ahash::RandomState,
    entries: AtomicUsize,
    /// Entries per metric name, only maintained when a per-metric limit is configured.
    per_metric: Mutex<HashMap<MetricName, usize>>,
    counters: Counters,
}

impl Accumulator {
    fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::default()).collect(),
            hasher: ahash::RandomState::new(),
            entries: AtomicUsize::new(0),
            per_metric: Mutex::default(),
            counters: Counters::default(),
        }
    }

    fn shard(&self, id: &MetricId) -> &Mutex<Shard> {
        let index = self.hasher.hash_one(id) as usize % self.shards.len();
        &self.shards[index]
    }

    fn insert(
        &self,
        metric: Metric,
        config: &AggregatorConfig,
    ) -> Result<Accepted, AggregateMetricsError> {
        let id = metric.id();
        let mut shard = self.shard(&id).lock();

        match shard.entries.entry(id) {
            Entry::Occupied(mut entry) => {
                if let Err(error) = entry.get_mut().merge(metric) {
                    Counters::incr(&self.counters.merge_failures);
                    return Err(error);
                }
                Counters::incr(&self.counters.merges);
                Ok(Accepted::Merged)
            }
            Entry::Vacant(entry) => {
                self.reserve(metric.name(), config)?;
                entry.insert(metric);
                Counters::incr(&self.counters.created);
                Ok(Accepted::Created)
            }
        }
    }

    /// Reserves capacity for a new entry with the given name.
    fn reserve(
        &self,
        name: &MetricName,
        config: &AggregatorConfig,
    ) -> Result<(), AggregateMetricsError> {
        let previous = self.entries.fetch_add(1, Ordering::AcqRel);
        if config.max_total_entries.is_some_and(|max| previous >= max) {
            self.entries.fetch_sub(1, Ordering::AcqRel);
            Counters::incr(&self.counters.dropped_total);
            return Err(AggregateMetricsError::TotalLimitExceeded);
        }

        if let Some(max) = config.max_entries_per_metric {
            let mut per_metric = self.per_metric.lock();
            let count = per_metric.entry(name.clone()).or_default();
            if *count >= max {
                self.entries.fetch_sub(1, Ordering::AcqRel);
                Counters::incr(&self.counters.dropped_per_metric);
                return Err(AggregateMetricsError::MetricLimitExceeded(name.clone()));
            }
            *count += 1;
        }

        Ok(())
    }

    fn into_metrics(self) -> Vec<Metric> {
        let mut metrics = Vec::with_capacity(self.entries.into_inner());
        for shard in self.shards {
            metrics.extend(shard.into_inner().entries.into_values());
        }
        metrics
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicI64;

    use chrono::{TimeZone, Utc};
    use similar_asserts::assert_eq;

    use super::*;
    use crate::protocol::{EntityId, MetricKey};
    use crate::value::{MetricValue, Observation};

    fn now() -> UnixTimestamp {
        let date = Utc.with_ymd_and_hms(2024, 2, 29, 13, 7, 30).unwrap();
        UnixTimestamp::from_datetime(date).unwrap()
    }

    fn sum(name: &str, entity: &str, bucket: u64, value: i64) -> Metric {
        Metric::new(
            MetricKey::new(
                MetricName::new(name).unwrap(),
                EntityId::from(entity),
                TimeBucket::parse(bucket).unwrap(),
            ),
            MetricValue::Sum(value),
        )
    }

    fn aggregator(config: AggregatorConfig) -> Aggregator {
        Aggregator::named("test".to_owned(), Granularity::Minute, config)
    }

    fn total(metrics: &[Metric]) -> i64 {
        metrics.iter().filter_map(|m| m.value.value()).sum()
    }

    #[test]
    fn test_accept_merges_same_key() {
        let aggregator = aggregator(AggregatorConfig::default());

        assert_eq!(
            aggregator.accept(sum("service_cpm", "a", 202402291307, 1)),
            Ok(Accepted::Created)
        );
        assert_eq!(
            aggregator.accept(sum("service_cpm", "a", 202402291307, 2)),
            Ok(Accepted::Merged)
        );
        aggregator
            .accept(sum("service_cpm", "b", 202402291307, 4))
            .unwrap();
        assert_eq!(aggregator.len(), 2);

        let mut metrics = aggregator.drain(now());
        metrics.sort_by_key(|m| m.id());
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].value, MetricValue::Sum(3));
        assert_eq!(metrics[1].value, MetricValue::Sum(4));
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_accept_wrong_granularity() {
        let aggregator = aggregator(AggregatorConfig::default());
        let result = aggregator.accept(sum("service_cpm", "a", 2024022913, 1));
        assert_eq!(
            result,
            Err(AggregateMetricsError::InvalidGranularity {
                from: Granularity::Hour,
                to: Granularity::Minute,
            })
        );
    }

    #[test]
    fn test_merge_failure_keeps_entry() {
        let aggregator = aggregator(AggregatorConfig::default());
        aggregator
            .accept(sum("service_cpm", "a", 202402291307, 5))
            .unwrap();

        let mut max = sum("service_cpm", "a", 202402291307, 0);
        max.value = MetricValue::from_observation(Observation::Max(100));
        assert!(matches!(
            aggregator.accept(max),
            Err(AggregateMetricsError::InvalidTypes { .. })
        ));

        let metrics = aggregator.drain(now());
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].value, MetricValue::Sum(5));
    }

    #[test]
    fn test_drain_completeness() {
        let aggregator = aggregator(AggregatorConfig {
            shards: 4,
            ..Default::default()
        });
        let drained = AtomicI64::new(0);

        std::thread::scope(|s| {
            for thread in 0..8 {
                let aggregator = &aggregator;
                s.spawn(move || {
                    for i in 0..125 {
                        let entity = format!("entity{}", (thread * 125 + i) % 10);
                        aggregator
                            .accept(sum("service_cpm", &entity, 202402291307, 1))
                            .unwrap();
                    }
                });
            }

            let aggregator = &aggregator;
            let drained = &drained;
            s.spawn(move || {
                for _ in 0..10 {
                    // Draining at a time before the bucket ended keeps accepting it.
                    let metrics = aggregator.drain(UnixTimestamp::from_secs(0));
                    drained.fetch_add(total(&metrics), Ordering::Relaxed);
                    std::thread::yield_now();
                }
            });
        });

        let rest = aggregator.drain(UnixTimestamp::from_secs(0));
        let drained = drained.load(Ordering::Relaxed) + total(&rest);
        assert_eq!(drained, 1000);
    }

    #[test]
    fn test_drain_completeness_single_key() {
        let aggregator = aggregator(AggregatorConfig::default());
        let accepted = AtomicUsize::new(0);

        let pre_drain = std::thread::scope(|s| {
            for _ in 0..4 {
                let aggregator = &aggregator;
                let accepted = &accepted;
                s.spawn(move || {
                    for _ in 0..250 {
                        aggregator
                            .accept(sum("service_cpm", "k", 202402291307, 1))
                            .unwrap();
                        accepted.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }

            while accepted.load(Ordering::Relaxed) < 500 {
                std::thread::yield_now();
            }
            aggregator.drain(UnixTimestamp::from_secs(0))
        });

        let post_drain = aggregator.drain(UnixTimestamp::from_secs(0));
        assert!(pre_drain.len() <= 1 && post_drain.len() <= 1);
        assert!(total(&pre_drain) >= 500);
        assert_eq!(total(&pre_drain) + total(&post_drain), 1000);
    }

    #[test]
    fn test_completed_bucket_never_stored() {
        let aggregator = aggregator(AggregatorConfig::default());
        aggregator.drain(now());

        // 13:06 completed with the drain above, nothing may reach the fresh accumulator.
        for _ in 0..10 {
            let late = sum("service_cpm", "a", 202402291306, 1);
            assert!(matches!(aggregator.accept(late), Ok(Accepted::Late(_))));
        }
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_late_arrival() {
        let aggregator = aggregator(AggregatorConfig::default());
        aggregator
            .accept(sum("service_cpm", "a", 202402291306, 1))
            .unwrap();

        let metrics = aggregator.drain(now());
        assert_eq!(metrics.len(), 1);
        assert_eq!(
            aggregator.watermark(),
            Some(TimeBucket::parse(202402291306).unwrap())
        );

        let late = sum("service_cpm", "a", 202402291306, 1);
        assert_eq!(aggregator.accept(late.clone()), Ok(Accepted::Late(late)));

        // The current minute is still open.
        assert_eq!(
            aggregator.accept(sum("service_cpm", "a", 202402291307, 1)),
            Ok(Accepted::Created)
        );
    }

    #[test]
    fn test_total_limit() {
        let aggregator = aggregator(AggregatorConfig {
            max_total_entries: Some(2),
            ..Default::default()
        });

        aggregator.accept(sum("a", "1", 202402291307, 1)).unwrap();
        aggregator.accept(sum("b", "1", 202402291307, 1)).unwrap();
        assert_eq!(
            aggregator.accept(sum("c", "1", 202402291307, 1)),
            Err(AggregateMetricsError::TotalLimitExceeded)
        );
        // Merges are still admitted.
        assert_eq!(
            aggregator.accept(sum("a", "1", 202402291307, 1)),
            Ok(Accepted::Merged)
        );
        assert_eq!(aggregator.len(), 2);
    }

    #[test]
    fn test_per_metric_limit() {
        let aggregator = aggregator(AggregatorConfig {
            max_entries_per_metric: Some(2),
            ..Default::default()
        });

        for entity in ["1", "2"] {
            aggregator.accept(sum("noisy", entity, 202402291307, 1)).unwrap();
        }

        assert_eq!(
            aggregator.accept(sum("noisy", "3", 202402291307, 1)),
            Err(AggregateMetricsError::MetricLimitExceeded(
                MetricName::new("noisy").unwrap()
            ))
        );
        assert_eq!(
            aggregator.accept(sum("quiet", "3", 202402291307, 1)),
            Ok(Accepted::Created)
        );

        // Limits reset with every drain.
        aggregator.drain(UnixTimestamp::from_secs(0));
        assert_eq!(
            aggregator.accept(sum("noisy", "3", 202402291307, 1)),
            Ok(Accepted::Created)
        );
    }

    #[test]
    fn test_drain_emits_stats() {
        let aggregator = aggregator(AggregatorConfig::default());
        aggregator.accept(sum("a", "1", 202402291307, 1)).unwrap();

        let captures = tally_statsd::with_capturing_test_client(|| {
            aggregator.drain(UnixTimestamp::from_secs(0));
        });

        assert!(
            captures
                .iter()
                .any(|c| c == "metrics.drain.entries:1|d|#aggregator:test")
        );
        assert!(
            captures
                .iter()
                .any(|c| c == "metrics.entries:0|g|#aggregator:test")
        );
    }
}
