use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use tally_cluster::{
    DispatchMetrics, LocalWorker, NodeAddress, RemoteDispatcher, Route, ShardRouter,
};
use tally_common::time::UnixTimestamp;
use tally_metrics::{
    Accepted, AggregateMetricsError, Aggregator, AggregatorConfig, Granularity, Metric,
};
use tally_statsd::metric;
use tally_system::{
    Addr, AsyncResponse, Controller, FromMessage, Interface, Receiver, Sender, Service,
};
use tokio::time::MissedTickBehavior;

use crate::services::downsampling::Downsampler;
use crate::services::persistence::{Persistence, StoreMetrics};
use crate::statsd::{ServerCounters, ServerDistributions, ServerTimers};

/// Hands metrics owned by other cluster members to the remote dispatcher.
#[derive(Clone, Debug)]
pub struct ShardRouting {
    router: ShardRouter,
    dispatcher: Addr<RemoteDispatcher>,
}

impl ShardRouting {
    /// Creates a routing stage on top of the router and dispatcher.
    pub fn new(router: ShardRouter, dispatcher: Addr<RemoteDispatcher>) -> Self {
        Self { router, dispatcher }
    }

    /// Dispatches all metrics owned by peers and returns the ones owned by this node.
    ///
    /// Dispatched metrics are sent as they are, one message per destination.
    fn dispatch_remote(&self, metrics: Vec<Metric>, granularity: Granularity) -> Vec<Metric> {
        let mut local = Vec::with_capacity(metrics.len());
        let mut remote = HashMap::<NodeAddress, Vec<Metric>>::new();

        for metric in metrics {
            match self.router.route(&metric) {
                Route::Local => local.push(metric),
                Route::Remote(node) => remote.entry(node).or_default().push(metric),
            }
        }

        for (node, metrics) in remote {
            metric!(
                counter(ServerCounters::MetricDispatched) += metrics.len() as i64,
                granularity = granularity.as_str(),
            );
            self.dispatcher.send(DispatchMetrics { node, metrics });
        }

        local
    }
}

#[derive(Debug)]
struct WorkerInner {
    aggregator: Aggregator,
    persistence: Addr<Persistence>,
    downsampler: Downsampler,
    routing: Option<ShardRouting>,
}

/// The streaming aggregation worker of one granularity.
///
/// Metrics are accepted concurrently from any thread. A flush drains the aggregator, finalizes
/// every drained metric, forwards a downsampled copy into the next coarser worker and sends the
/// finalized batch to persistence.
///
/// A worker with [`ShardRouting`] first hands every drained metric owned by a peer to the remote
/// dispatcher. Those metrics are not finalized here, the owner merges them into its own worker.
///
/// The handle is cheap to clone, all clones share the same aggregator.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    inner: Arc<WorkerInner>,
}

impl WorkerHandle {
    /// Creates a worker for `granularity`.
    pub fn new(
        granularity: Granularity,
        config: AggregatorConfig,
        persistence: Addr<Persistence>,
        downsampler: Downsampler,
    ) -> Self {
        Self::build(granularity, config, persistence, downsampler, None)
    }

    /// Creates a worker for `granularity` that dispatches metrics owned by peers on flush.
    pub fn routed(
        granularity: Granularity,
        config: AggregatorConfig,
        persistence: Addr<Persistence>,
        downsampler: Downsampler,
        routing: ShardRouting,
    ) -> Self {
        Self::build(granularity, config, persistence, downsampler, Some(routing))
    }

    fn build(
        granularity: Granularity,
        config: AggregatorConfig,
        persistence: Addr<Persistence>,
        downsampler: Downsampler,
        routing: Option<ShardRouting>,
    ) -> Self {
        let aggregator = Aggregator::named(granularity.as_str().to_owned(), granularity, config);

        Self {
            inner: Arc::new(WorkerInner {
                aggregator,
                persistence,
                downsampler,
                routing,
            }),
        }
    }

    /// Returns the granularity of this worker.
    pub fn granularity(&self) -> Granularity {
        self.inner.aggregator.granularity()
    }

    /// Returns the underlying aggregator.
    pub fn aggregator(&self) -> &Aggregator {
        &self.inner.aggregator
    }

    /// Returns the downsampler feeding the next coarser worker.
    pub fn downsampler(&self) -> &Downsampler {
        &self.inner.downsampler
    }

    /// Accepts a metric of this worker's granularity.
    ///
    /// Metrics arriving after their bucket was flushed are emitted immediately as a delta.
    /// Rejected metrics are logged and discarded.
    pub fn accept(&self, metric: Metric) {
        let granularity = self.granularity();

        match self.inner.aggregator.accept(metric) {
            Ok(Accepted::Created | Accepted::Merged) => (),
            Ok(Accepted::Late(metric)) => {
                tally_log::trace!(
                    granularity = granularity.as_str(),
                    metric = %metric.id(),
                    "persisting late metric as delta"
                );
                metric!(
                    counter(ServerCounters::LateMetric) += 1,
                    granularity = granularity.as_str(),
                );
                self.emit(vec![metric]);
            }
            // Counted by the aggregator and reported on the next drain.
            Err(
                AggregateMetricsError::TotalLimitExceeded
                | AggregateMetricsError::MetricLimitExceeded(_),
            ) => (),
            Err(error) => {
                tally_log::error!(
                    error = &error as &dyn std::error::Error,
                    granularity = granularity.as_str(),
                    "discarding metric rejected by worker"
                );
                metric!(
                    counter(ServerCounters::MetricRejected) += 1,
                    granularity = granularity.as_str(),
                );
            }
        }
    }

    /// Drains the worker and emits all drained metrics.
    ///
    /// Returns the number of flushed metrics.
    pub fn flush(&self, now: UnixTimestamp) -> usize {
        let granularity = self.granularity();

        metric!(
            timer(ServerTimers::FlushDuration),
            granularity = granularity.as_str(),
            {
                let metrics = self.inner.aggregator.drain(now);
                let flushed = metrics.len();

                metric!(
                    distribution(ServerDistributions::FlushedMetrics) = flushed as u64,
                    granularity = granularity.as_str(),
                );
                self.emit(metrics);

                flushed
            }
        )
    }

    /// Flushes this worker and then every coarser worker of the chain, in order.
    ///
    /// Returns the total number of flushed metrics.
    pub fn flush_chain(&self, now: UnixTimestamp) -> usize {
        let mut flushed = 0;
        let mut worker = Some(self);

        while let Some(current) = worker {
            flushed += current.flush(now);
            worker = current.downsampler().next();
        }

        flushed
    }

    fn emit(&self, metrics: Vec<Metric>) {
        let mut metrics = match &self.inner.routing {
            Some(routing) => routing.dispatch_remote(metrics, self.granularity()),
            None => metrics,
        };

        if metrics.is_empty() {
            return;
        }

        for metric in &mut metrics {
            metric.finalize();
        }

        self.inner.downsampler.forward(&metrics);
        self.inner.persistence.send(StoreMetrics {
            granularity: self.granularity(),
            metrics,
        });
    }
}

impl LocalWorker for WorkerHandle {
    fn accept(&self, metric: Metric) {
        WorkerHandle::accept(self, metric)
    }
}

/// Drains a worker immediately.
///
/// Responds with the number of flushed metrics.
#[derive(Debug)]
pub struct FlushAggregator {
    /// The time used to advance the watermark of the worker.
    pub now: UnixTimestamp,
}

/// Service interface of the [`AggregatorService`].
#[derive(Debug)]
pub enum AggregatorFlush {
    /// See [`FlushAggregator`].
    Flush(FlushAggregator, Sender<usize>),
}

impl Interface for AggregatorFlush {}

impl FromMessage<FlushAggregator> for AggregatorFlush {
    type Response = AsyncResponse<usize>;

    fn from_message(message: FlushAggregator, sender: Sender<usize>) -> Self {
        Self::Flush(message, sender)
    }
}

/// Flushes a [`WorkerHandle`] on its configured interval.
///
/// On shutdown, the service flushes its worker and all coarser workers of the chain.
#[derive(Debug)]
pub struct AggregatorService {
    worker: WorkerHandle,
    flush_interval: Duration,
}

impl AggregatorService {
    /// Creates a service flushing `worker` every `flush_interval`.
    pub fn new(worker: WorkerHandle, flush_interval: Duration) -> Self {
        Self {
            worker,
            flush_interval,
        }
    }

    fn handle_shutdown(&self) {
        let granularity = self.worker.granularity();
        tally_log::info!(
            granularity = granularity.as_str(),
            "shutting down worker, flushing remaining metrics"
        );

        let flushed = self.worker.flush_chain(UnixTimestamp::now());
        tally_log::debug!(
            granularity = granularity.as_str(),
            "force flushed {flushed} metrics"
        );
    }
}

impl Service for AggregatorService {
    type Interface = AggregatorFlush;

    async fn run(self, mut rx: Receiver<Self::Interface>) {
        let mut shutdown = Controller::shutdown_handle();

        let start = tokio::time::Instant::now() + self.flush_interval;
        let mut ticker = tokio::time::interval_at(start, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = ticker.tick() => {
                    self.worker.flush(UnixTimestamp::now());
                }
                message = rx.recv() => match message {
                    Some(AggregatorFlush::Flush(FlushAggregator { now }, sender)) => {
                        sender.send(self.worker.flush(now));
                    }
                    None => break,
                },
                _ = shutdown.notified() => {
                    self.handle_shutdown();
                    break;
                }
            }
        }
    }
}
