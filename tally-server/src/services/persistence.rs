use std::sync::Arc;
use std::time::Instant;

use tally_common::retry::RetryConfig;
use tally_common::time::UnixTimestamp;
use tally_config::Config;
use tally_log::LogError;
use tally_metrics::{Granularity, Metric, TimeBucket};
use tally_statsd::metric;
use tally_system::{AsyncResponse, FromMessage, Interface, NoResponse, Receiver, Sender, Service};
use tokio::task::JoinSet;

use crate::statsd::{ServerCounters, ServerTimers};
use crate::storage::{StorageError, StorageSink};

/// Writes finalized metrics of one granularity to storage.
#[derive(Debug)]
pub struct StoreMetrics {
    /// The granularity of all metrics in the batch.
    pub granularity: Granularity,
    /// The finalized metrics.
    pub metrics: Vec<Metric>,
}

/// Removes metrics older than the configured retention of each granularity.
///
/// Responds with the total number of removed metrics.
#[derive(Debug)]
pub struct SweepHistory {
    /// The reference time for computing retention deadlines.
    pub now: UnixTimestamp,
}

/// Resolves once all writes enqueued before this message have completed or were given up.
#[derive(Debug)]
pub struct SyncPersistence;

/// Service interface of the [`PersistenceService`].
#[derive(Debug)]
pub enum Persistence {
    /// See [`StoreMetrics`].
    Store(StoreMetrics),
    /// See [`SweepHistory`].
    Sweep(SweepHistory, Sender<usize>),
    /// See [`SyncPersistence`].
    Sync(SyncPersistence, Sender<()>),
}

impl Interface for Persistence {}

impl FromMessage<StoreMetrics> for Persistence {
    type Response = NoResponse;

    fn from_message(message: StoreMetrics, _: ()) -> Self {
        Self::Store(message)
    }
}

impl FromMessage<SweepHistory> for Persistence {
    type Response = AsyncResponse<usize>;

    fn from_message(message: SweepHistory, sender: Sender<usize>) -> Self {
        Self::Sweep(message, sender)
    }
}

impl FromMessage<SyncPersistence> for Persistence {
    type Response = AsyncResponse<()>;

    fn from_message(message: SyncPersistence, sender: Sender<()>) -> Self {
        Self::Sync(message, sender)
    }
}

/// Writes finalized metrics to a [`StorageSink`].
///
/// Every batch is written in its own task. Failed and timed out writes are retried with
/// exponential backoff until the configured number of attempts is exhausted, after which the
/// batch is dropped and counted.
#[derive(Debug)]
pub struct PersistenceService<S> {
    config: Arc<Config>,
    storage: Arc<S>,
    writes: JoinSet<()>,
}

impl<S: StorageSink> PersistenceService<S> {
    /// Creates a new persistence service writing to `storage`.
    pub fn new(config: Arc<Config>, storage: Arc<S>) -> Self {
        Self {
            config,
            storage,
            writes: JoinSet::new(),
        }
    }

    fn handle_store(&mut self, message: StoreMetrics) {
        let StoreMetrics {
            granularity,
            metrics,
        } = message;

        if metrics.is_empty() {
            return;
        }

        let storage = self.storage.clone();
        let retry = self.config.persistence_retry().clone();
        self.writes.spawn(async move {
            write_with_retry(&*storage, granularity, metrics, &retry).await;
        });
    }

    async fn handle_sweep(&self, message: SweepHistory) -> usize {
        let mut total = 0;

        for granularity in Granularity::ALL {
            let deadline = message.now - self.config.retention(granularity);
            let Some(before) = TimeBucket::from_timestamp(deadline, granularity) else {
                continue;
            };

            match self.storage.delete_history(granularity, before).await {
                Ok(removed) => {
                    tally_log::debug!(
                        granularity = granularity.as_str(),
                        before = before.as_u64(),
                        removed,
                        "deleted metric history"
                    );
                    metric!(
                        counter(ServerCounters::HistoryDeleted) += removed as i64,
                        granularity = granularity.as_str(),
                    );
                    total += removed;
                }
                Err(error) => {
                    tally_log::error!(
                        granularity = granularity.as_str(),
                        "failed to delete metric history: {}",
                        LogError(&error)
                    );
                }
            }
        }

        total
    }

    async fn wait_for_writes(&mut self) {
        while self.writes.join_next().await.is_some() {}
    }
}

/// Writes a batch, retrying failed and timed out attempts with exponential backoff.
async fn write_with_retry<S: StorageSink>(
    storage: &S,
    granularity: Granularity,
    metrics: Vec<Metric>,
    retry: &RetryConfig,
) {
    let mut backoff = retry.backoff();

    loop {
        tokio::time::sleep(backoff.next_backoff()).await;
        let attempt = backoff.attempt();

        let started = Instant::now();
        let result = tokio::time::timeout(
            retry.attempt_timeout(),
            storage.batch_write(granularity, &metrics),
        )
        .await
        .unwrap_or(Err(StorageError::Timeout));

        let status = match &result {
            Ok(()) => "ok",
            Err(StorageError::Timeout) => "timeout",
            Err(_) => "error",
        };
        metric!(
            timer(ServerTimers::StorageWriteDuration) = started.elapsed(),
            granularity = granularity.as_str(),
            result = status,
        );

        let error = match result {
            Ok(()) => {
                metric!(
                    counter(ServerCounters::MetricsPersisted) += metrics.len() as i64,
                    granularity = granularity.as_str(),
                );
                return;
            }
            Err(error) => error,
        };

        if attempt < retry.max_attempts as usize {
            tally_log::debug!(
                granularity = granularity.as_str(),
                attempt,
                "failed to write metrics, retrying: {}",
                LogError(&error)
            );
            metric!(
                counter(ServerCounters::StorageRetried) += 1,
                granularity = granularity.as_str(),
            );
            continue;
        }

        tally_log::error!(
            granularity = granularity.as_str(),
            attempts = attempt,
            metrics = metrics.len(),
            "dropping metrics after exhausting storage retries: {}",
            LogError(&error)
        );
        metric!(
            counter(ServerCounters::StorageDropped) += metrics.len() as i64,
            granularity = granularity.as_str(),
        );
        return;
    }
}

impl<S: StorageSink> Service for PersistenceService<S> {
    type Interface = Persistence;

    async fn run(mut self, mut rx: Receiver<Self::Interface>) {
        loop {
            tokio::select! {
                biased;

                Some(_) = self.writes.join_next() => (),
                message = rx.recv() => match message {
                    Some(Persistence::Store(message)) => self.handle_store(message),
                    Some(Persistence::Sweep(message, sender)) => {
                        sender.send(self.handle_sweep(message).await);
                    }
                    Some(Persistence::Sync(SyncPersistence, sender)) => {
                        self.wait_for_writes().await;
                        sender.send(());
                    }
                    None => break,
                },
            }
        }

        // All senders are gone, finish what was accepted.
        self.wait_for_writes().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tally_metrics::{EntityId, MetricName, Observation};
    use tally_system::Addr;

    use super::*;
    use crate::storage::{MemoryStorage, WriteStats};

    fn config() -> Arc<Config> {
        let config = Config::from_json_value(serde_json::json!({
            "persistence": {
                "retry": {
                    "max_attempts": 3,
                    "initial_interval_ms": 100,
                    "attempt_timeout_ms": 1000
                },
                "retention": {"minute": 1, "hour": 1}
            }
        }));
        Arc::new(config.unwrap())
    }

    fn start(storage: &Arc<MemoryStorage>) -> Addr<Persistence> {
        PersistenceService::new(config(), storage.clone()).start_detached()
    }

    fn metric(secs: u64) -> Metric {
        Metric::from_observation(
            MetricName::new("service_cpm").unwrap(),
            EntityId::from("1"),
            UnixTimestamp::from_secs(secs),
            Observation::Cpm(1),
        )
        .unwrap()
    }

    fn at_granularity(metric: Metric, granularity: Granularity) -> Metric {
        match granularity {
            Granularity::Minute => metric,
            _ => metric.downsample(granularity).unwrap(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        tally_test::setup();
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_next(2);

        let addr = start(&storage);
        addr.send(StoreMetrics {
            granularity: Granularity::Minute,
            metrics: vec![metric(1709212020)],
        });
        addr.send(SyncPersistence).await.unwrap();

        assert_eq!(
            storage.stats(Granularity::Minute),
            WriteStats {
                inserts: 1,
                merges: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_after_max_attempts() {
        tally_test::setup();
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_next(3);

        let addr = start(&storage);
        addr.send(StoreMetrics {
            granularity: Granularity::Minute,
            metrics: vec![metric(1709212020)],
        });
        addr.send(SyncPersistence).await.unwrap();

        assert!(storage.metrics(Granularity::Minute).is_empty());

        // The next batch is written normally.
        addr.send(StoreMetrics {
            granularity: Granularity::Minute,
            metrics: vec![metric(1709212020)],
        });
        addr.send(SyncPersistence).await.unwrap();
        assert_eq!(storage.metrics(Granularity::Minute).len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_history() {
        tally_test::setup();
        let storage = Arc::new(MemoryStorage::new());
        let addr = start(&storage);

        let now = UnixTimestamp::from_secs(1709212020);
        let old = now - Duration::from_secs(2 * 24 * 3600);
        let recent = now - Duration::from_secs(3600);

        for granularity in [Granularity::Minute, Granularity::Hour] {
            let metrics = [old, recent]
                .into_iter()
                .map(|ts| at_granularity(metric(ts.as_secs()), granularity))
                .collect();
            addr.send(StoreMetrics {
                granularity,
                metrics,
            });
        }
        addr.send(SyncPersistence).await.unwrap();

        let removed = addr.send(SweepHistory { now }).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(storage.metrics(Granularity::Minute).len(), 1);
        assert_eq!(storage.metrics(Granularity::Hour).len(), 1);
    }
}
