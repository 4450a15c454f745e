//! The storage boundary of the pipeline.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tally_metrics::{Granularity, Metric, MetricId, TimeBucket};

/// An error returned by a [`StorageSink`].
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The storage backend could not be reached or failed the operation.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// The attempt did not complete in time.
    #[error("storage request timed out")]
    Timeout,
}

/// Persists finalized metrics.
///
/// Writes are merge-on-write: writing a metric whose id already exists at the same granularity
/// merges the written metric into the stored one and finalizes the result. This makes late
/// arrivals and metrics split between two owners after a membership change converge into a
/// single row.
pub trait StorageSink: Send + Sync + 'static {
    /// Writes a batch of finalized metrics of one granularity.
    fn batch_write(
        &self,
        granularity: Granularity,
        metrics: &[Metric],
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Removes all metrics of the given granularity with a time bucket before `before`.
    ///
    /// Returns the number of removed metrics.
    fn delete_history(
        &self,
        granularity: Granularity,
        before: TimeBucket,
    ) -> impl Future<Output = Result<usize, StorageError>> + Send;
}

/// Write statistics of a [`MemoryStorage`] for one granularity.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WriteStats {
    /// Number of metrics written as new rows.
    pub inserts: usize,
    /// Number of metrics merged into existing rows.
    pub merges: usize,
}

#[derive(Debug, Default)]
struct Table {
    rows: HashMap<MetricId, Metric>,
    stats: WriteStats,
}

/// An in-memory [`StorageSink`].
///
/// Besides the stored metrics, the storage keeps [`WriteStats`] per granularity. Writes can be
/// made to fail with [`fail_next`](Self::fail_next).
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: Mutex<HashMap<Granularity, Table>>,
    failures: AtomicUsize,
}

impl MemoryStorage {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail with [`StorageError::Unavailable`].
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Returns all stored metrics of a granularity, ordered by id.
    pub fn metrics(&self, granularity: Granularity) -> Vec<Metric> {
        let tables = self.tables.lock();
        let mut metrics: Vec<_> = tables
            .get(&granularity)
            .map(|table| table.rows.values().cloned().collect())
            .unwrap_or_default();

        metrics.sort_by(|a, b| a.id().cmp(&b.id()));
        metrics
    }

    /// Returns the stored metric with the given id.
    pub fn get(&self, granularity: Granularity, id: &MetricId) -> Option<Metric> {
        self.tables.lock().get(&granularity)?.rows.get(id).cloned()
    }

    /// Returns the write statistics of a granularity.
    pub fn stats(&self, granularity: Granularity) -> WriteStats {
        self.tables
            .lock()
            .get(&granularity)
            .map(|table| table.stats)
            .unwrap_or_default()
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn write(&self, granularity: Granularity, metrics: &[Metric]) {
        let mut tables = self.tables.lock();
        let table = tables.entry(granularity).or_default();

        for metric in metrics {
            let id = metric.id();
            match table.rows.get_mut(&id) {
                Some(stored) => match stored.merge(metric.clone()) {
                    Ok(()) => {
                        stored.finalize();
                        table.stats.merges += 1;
                    }
                    Err(error) => {
                        tally_log::error!(
                            error = &error as &dyn std::error::Error,
                            metric = %id,
                            "failed to merge metric into stored row"
                        );
                    }
                },
                None => {
                    let mut metric = metric.clone();
                    metric.finalize();
                    table.rows.insert(id, metric);
                    table.stats.inserts += 1;
                }
            }
        }
    }
}

impl StorageSink for MemoryStorage {
    fn batch_write(
        &self,
        granularity: Granularity,
        metrics: &[Metric],
    ) -> impl Future<Output = Result<(), StorageError>> + Send {
        let result = match self.take_failure() {
            true => Err(StorageError::Unavailable("injected failure".to_owned())),
            false => {
                self.write(granularity, metrics);
                Ok(())
            }
        };

        std::future::ready(result)
    }

    fn delete_history(
        &self,
        granularity: Granularity,
        before: TimeBucket,
    ) -> impl Future<Output = Result<usize, StorageError>> + Send {
        let mut tables = self.tables.lock();
        let removed = match tables.get_mut(&granularity) {
            Some(table) => {
                let len = table.rows.len();
                table.rows.retain(|_, metric| metric.time_bucket() >= before);
                len - table.rows.len()
            }
            None => 0,
        };

        std::future::ready(Ok(removed))
    }
}

#[cfg(test)]
mod tests {
    use tally_common::time::UnixTimestamp;
    use tally_metrics::{EntityId, MetricName, Observation};

    use super::*;

    fn metric(secs: u64, value: i64) -> Metric {
        Metric::from_observation(
            MetricName::new("service_resp_time").unwrap(),
            EntityId::from("1"),
            UnixTimestamp::from_secs(secs),
            Observation::Avg(value),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_merge_on_write() {
        let storage = MemoryStorage::new();

        storage
            .batch_write(Granularity::Minute, &[metric(1709212020, 10)])
            .await
            .unwrap();
        storage
            .batch_write(Granularity::Minute, &[metric(1709212030, 30)])
            .await
            .unwrap();

        let stored = storage.metrics(Granularity::Minute);
        assert_eq!(stored.len(), 1);
        // The stored row is finalized again after merging.
        assert_eq!(stored[0].value.value(), Some(20));
        assert_eq!(
            storage.stats(Granularity::Minute),
            WriteStats {
                inserts: 1,
                merges: 1
            }
        );
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let storage = MemoryStorage::new();
        storage.fail_next(1);

        let result = storage
            .batch_write(Granularity::Minute, &[metric(1709212020, 10)])
            .await;
        assert!(matches!(result, Err(StorageError::Unavailable(_))));

        storage
            .batch_write(Granularity::Minute, &[metric(1709212020, 10)])
            .await
            .unwrap();
        assert_eq!(storage.stats(Granularity::Minute).inserts, 1);
    }

    #[tokio::test]
    async fn test_delete_history() {
        let storage = MemoryStorage::new();
        storage
            .batch_write(
                Granularity::Minute,
                &[metric(1709212020, 1), metric(1709215620, 1)],
            )
            .await
            .unwrap();

        // 2024-02-29 14:00 UTC
        let before = TimeBucket::parse(202402291400).unwrap();
        let removed = storage
            .delete_history(Granularity::Minute, before)
            .await
            .unwrap();

        assert_eq!(removed, 1);
        let remaining = storage.metrics(Granularity::Minute);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].time_bucket().as_u64(), 202402291407);
    }
}
