use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use tally_common::retry::RetryConfig;
use tally_log::LogError;
use tally_metrics::{AggregateMetricsError, Metric, MetricId, MetricName};
use tally_statsd::metric;
use tally_system::{
    AsyncResponse, Controller, FromMessage, Interface, NoResponse, Receiver, Sender, Service,
};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::config::DispatchConfig;
use crate::context::NodeAddress;
use crate::statsd::{ClusterCounters, ClusterDistributions, ClusterGauges, ClusterTimers};
use crate::transport::{ClusterTransport, RemoteBatch, TransportError};

/// Queues aggregated metrics for delivery to their owning peer.
///
/// The metrics are not finalized. The owner merges them into its local worker.
#[derive(Debug)]
pub struct DispatchMetrics {
    /// The owner of all metrics in this message.
    pub node: NodeAddress,
    /// The metrics to deliver.
    pub metrics: Vec<Metric>,
}

/// Sends all queued metrics immediately and waits until every send has completed or was given
/// up.
#[derive(Debug)]
pub struct FlushDispatch;

/// Service interface of the [`RemoteDispatcherService`].
#[derive(Debug)]
pub enum RemoteDispatcher {
    /// See [`DispatchMetrics`].
    Dispatch(DispatchMetrics),
    /// See [`FlushDispatch`].
    Flush(FlushDispatch, Sender<()>),
}

impl Interface for RemoteDispatcher {}

impl FromMessage<DispatchMetrics> for RemoteDispatcher {
    type Response = NoResponse;

    fn from_message(message: DispatchMetrics, _: ()) -> Self {
        Self::Dispatch(message)
    }
}

impl FromMessage<FlushDispatch> for RemoteDispatcher {
    type Response = AsyncResponse<()>;

    fn from_message(message: FlushDispatch, sender: Sender<()>) -> Self {
        Self::Flush(message, sender)
    }
}

/// The outcome of [`NodeQueue::push`].
#[derive(Debug)]
enum Queued {
    /// The metric was queued as a new entry.
    Inserted,
    /// The metric was merged into a queued metric with the same id.
    Merged,
    /// The queue was full and one metric was shed, either the pushed one or a queued one.
    Overflow,
    /// The metric could not be merged into the queued metric with the same id and was dropped.
    MergeFailed(AggregateMetricsError),
}

/// Metrics waiting for delivery to a single peer.
///
/// Metrics with the same id are merged while queued and count once against the queue size. When
/// the queue is full, the newest entry of the metric name with the most entries is shed.
#[derive(Debug, Default)]
struct NodeQueue {
    entries: HashMap<MetricId, Metric>,
    /// Queued ids per metric name, in insertion order.
    by_name: HashMap<MetricName, Vec<MetricId>>,
}

impl NodeQueue {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, metric: Metric, max_size: usize) -> Queued {
        let id = metric.id();
        if let Some(queued) = self.entries.get_mut(&id) {
            return match queued.merge(metric) {
                Ok(()) => Queued::Merged,
                Err(error) => Queued::MergeFailed(error),
            };
        }

        let mut outcome = Queued::Inserted;
        if self.entries.len() >= max_size {
            // The pushed metric is the newest entry of its name, so it is shed unless another
            // name has strictly more entries.
            let incoming = self.by_name.get(metric.name()).map_or(0, Vec::len) + 1;
            let victim = self
                .by_name
                .iter_mut()
                .filter(|(_, ids)| ids.len() > incoming)
                .max_by_key(|(_, ids)| ids.len())
                .and_then(|(_, ids)| ids.pop());

            let Some(victim) = victim else {
                return Queued::Overflow;
            };
            self.entries.remove(&victim);
            outcome = Queued::Overflow;
        }

        self.by_name
            .entry(metric.name().clone())
            .or_default()
            .push(id.clone());
        self.entries.insert(id, metric);
        outcome
    }

    fn into_metrics(self) -> Vec<Metric> {
        self.entries.into_values().collect()
    }
}

/// Batches metrics by destination and delivers them through a [`ClusterTransport`].
///
/// Batches are sent when the batch interval elapses or when a queue reaches the maximum batch
/// size. Every batch is sent in its own task, so a slow or unreachable peer does not hold up
/// other destinations. Failed attempts, including timeouts, are retried with exponential backoff
/// until the configured number of attempts is exhausted, after which the batch is dropped.
#[derive(Debug)]
pub struct RemoteDispatcherService<T> {
    config: DispatchConfig,
    transport: Arc<T>,
    queues: HashMap<NodeAddress, NodeQueue>,
    sends: JoinSet<()>,
}

impl<T: ClusterTransport> RemoteDispatcherService<T> {
    /// Creates a new dispatcher on top of the given transport.
    pub fn new(config: DispatchConfig, transport: Arc<T>) -> Self {
        Self {
            config,
            transport,
            queues: HashMap::new(),
            sends: JoinSet::new(),
        }
    }

    fn handle_dispatch(&mut self, message: DispatchMetrics) {
        let DispatchMetrics { node, metrics } = message;

        for metric in metrics {
            let queue = self.queues.entry(node.clone()).or_default();
            let outcome = queue.push(metric, self.config.max_queue_size);
            let full = queue.len() >= self.config.max_batch_size;

            match outcome {
                Queued::Inserted => (),
                Queued::Merged => {
                    metric!(counter(ClusterCounters::QueueMerged) += 1, node = node.as_str());
                }
                Queued::Overflow => {
                    tally_log::debug!(node = %node, "dispatch queue full, shedding metric");
                    metric!(counter(ClusterCounters::QueueOverflow) += 1, node = node.as_str());
                }
                Queued::MergeFailed(error) => {
                    tally_log::error!(
                        error = &error as &dyn std::error::Error,
                        node = %node,
                        "discarding metric that does not merge into queued metric"
                    );
                    metric!(
                        counter(ClusterCounters::QueueMergeFailed) += 1,
                        node = node.as_str(),
                    );
                }
            }

            if full {
                if let Some(queue) = self.queues.remove(&node) {
                    self.send_batches(node.clone(), queue.into_metrics());
                }
            }
        }
    }

    /// Spawns one send task per batch of at most `max_batch_size` metrics.
    fn send_batches(&mut self, node: NodeAddress, metrics: Vec<Metric>) {
        for chunk in metrics.chunks(self.config.max_batch_size.max(1)) {
            let batch = RemoteBatch::from_metrics(chunk);
            metric!(distribution(ClusterDistributions::BatchSize) = batch.len() as u64);

            let transport = self.transport.clone();
            let retry = self.config.retry.clone();
            let node = node.clone();
            self.sends
                .spawn(async move { send_with_retry(&*transport, node, batch, &retry).await });
        }
    }

    /// Sends all queued metrics.
    ///
    /// Queues are removed entirely, so destinations that left the cluster do not linger.
    fn flush_all(&mut self) {
        for (node, queue) in std::mem::take(&mut self.queues) {
            if !queue.is_empty() {
                self.send_batches(node, queue.into_metrics());
            }
        }

        metric!(gauge(ClusterGauges::InflightSends) = self.sends.len() as u64);
    }

    async fn wait_for_sends(&mut self) {
        while self.sends.join_next().await.is_some() {}
    }

    fn queued(&self) -> usize {
        self.queues.values().map(NodeQueue::len).sum()
    }
}

/// Sends a batch, retrying failed and timed out attempts with exponential backoff.
async fn send_with_retry<T: ClusterTransport>(
    transport: &T,
    node: NodeAddress,
    batch: RemoteBatch,
    retry: &RetryConfig,
) {
    let mut backoff = retry.backoff();

    loop {
        tokio::time::sleep(backoff.next_backoff()).await;
        let attempt = backoff.attempt();

        let started = Instant::now();
        let result = tokio::time::timeout(
            retry.attempt_timeout(),
            transport.send(&node, batch.clone()),
        )
        .await
        .unwrap_or_else(|_| Err(TransportError::Timeout));

        let status = match &result {
            Ok(()) => "ok",
            Err(TransportError::Timeout) => "timeout",
            Err(_) => "error",
        };
        metric!(
            timer(ClusterTimers::SendDuration) = started.elapsed(),
            node = node.as_str(),
            result = status,
        );

        let error = match result {
            Ok(()) => {
                metric!(counter(ClusterCounters::BatchSent) += 1, node = node.as_str());
                return;
            }
            Err(error) => error,
        };

        if attempt < retry.max_attempts as usize {
            tally_log::debug!(
                node = %node,
                attempt,
                "failed to send batch, retrying: {}",
                LogError(&error)
            );
            metric!(counter(ClusterCounters::BatchRetried) += 1, node = node.as_str());
            continue;
        }

        tally_log::error!(
            node = %node,
            attempts = attempt,
            metrics = batch.len(),
            "dropping batch after exhausting retries: {}",
            LogError(&error)
        );
        metric!(counter(ClusterCounters::BatchDropped) += 1, node = node.as_str());
        metric!(
            counter(ClusterCounters::MetricsDropped) += batch.len() as i64,
            node = node.as_str(),
        );
        return;
    }
}

impl<T: ClusterTransport> Service for RemoteDispatcherService<T> {
    type Interface = RemoteDispatcher;

    async fn run(mut self, mut rx: Receiver<Self::Interface>) {
        let mut ticker = tokio::time::interval(self.config.batch_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = Controller::shutdown_handle();

        tally_log::info!("remote dispatcher started");

        loop {
            tokio::select! {
                biased;

                Some(_) = self.sends.join_next() => (),
                _ = shutdown.notified() => break,
                _ = ticker.tick() => {
                    self.flush_all();
                    metric!(gauge(ClusterGauges::QueuedMetrics) = self.queued() as u64);
                }
                message = rx.recv() => match message {
                    Some(RemoteDispatcher::Dispatch(message)) => self.handle_dispatch(message),
                    Some(RemoteDispatcher::Flush(FlushDispatch, sender)) => {
                        self.flush_all();
                        self.wait_for_sends().await;
                        sender.send(());
                    }
                    None => break,
                },
            }
        }

        tally_log::info!("remote dispatcher stopping, sending pending batches");
        self.flush_all();
        self.wait_for_sends().await;
        tally_log::info!("remote dispatcher stopped");
    }
}
