use std::fmt;
use std::sync::Arc;

use tally_cluster::{
    ClusterContext, ClusterTransport, FlushDispatch, InboundHandler, NodeAddress,
    RemoteDispatcher, RemoteDispatcherService, ShardRouter,
};
use tally_common::time::UnixTimestamp;
use tally_config::Config;
use tally_metrics::Granularity;
use tally_registry::{IdentityRegistry, IdentitySink};
use tally_system::{Addr, Request, SendError, ServiceRunner};
use tokio::sync::watch;

use crate::services::aggregator::{
    AggregatorFlush, AggregatorService, FlushAggregator, ShardRouting, WorkerHandle,
};
use crate::services::downsampling::Downsampler;
use crate::services::ingest::{Ingested, Ingestor, Sample};
use crate::services::membership::MembershipService;
use crate::services::persistence::{
    Persistence, PersistenceService, SweepHistory, SyncPersistence,
};
use crate::storage::StorageSink;

#[derive(Clone, Debug)]
struct Worker {
    handle: WorkerHandle,
    flush: Addr<AggregatorFlush>,
}

/// A running aggregation pipeline of one node.
///
/// The pipeline is an explicit graph of services built once at startup:
///
/// ```text
/// observe -> ingest -> minute worker -> flush -> route -> remote dispatcher -> peer minute worker
///                                                     -> finalize -> persistence
///                                                                 -> downsample -> hour worker
/// hour worker -> day worker -> month worker
/// ```
///
/// Observations are merged by the minute worker of the node that received them. Only the merged
/// metrics owned by a peer leave the node, and the peer merges them again before finalizing.
///
/// The pipeline is cheap to clone, all clones refer to the same services.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    context: Arc<ClusterContext>,
    workers: Arc<[Worker; 4]>,
    ingestor: Ingestor,
    inbound: InboundHandler,
    dispatcher: Addr<RemoteDispatcher>,
    persistence: Addr<Persistence>,
    registry: IdentityRegistry,
}

impl Pipeline {
    /// Starts all services of the pipeline on the given runner.
    ///
    /// The cluster context is initialized from the configured node address and static member
    /// list. Use [`follow_membership`](Self::follow_membership) to apply runtime membership
    /// changes.
    pub fn start<S, I, T>(
        config: Arc<Config>,
        storage: Arc<S>,
        identities: Arc<I>,
        transport: Arc<T>,
        runner: &mut ServiceRunner,
    ) -> Self
    where
        S: StorageSink,
        I: IdentitySink,
        T: ClusterTransport,
    {
        let persistence = runner.start(PersistenceService::new(config.clone(), storage));

        let context = Arc::new(ClusterContext::new(
            config.node_address(),
            config.cluster_members(),
            config.hash_algorithm(),
        ));

        let dispatcher = runner.start(RemoteDispatcherService::new(
            config.dispatch_config().clone(),
            transport,
        ));

        let worker = |granularity: Granularity, next: Option<WorkerHandle>| {
            WorkerHandle::new(
                granularity,
                config.aggregator_config(granularity).clone(),
                persistence.clone(),
                Downsampler::new(next),
            )
        };

        let month = worker(Granularity::Month, None);
        let day = worker(Granularity::Day, Some(month.clone()));
        let hour = worker(Granularity::Hour, Some(day.clone()));

        // Only the minute worker sees metrics owned by peers. Coarser workers are fed by
        // downsampling metrics this node owns.
        let minute = WorkerHandle::routed(
            Granularity::Minute,
            config.aggregator_config(Granularity::Minute).clone(),
            persistence.clone(),
            Downsampler::new(Some(hour.clone())),
            ShardRouting::new(ShardRouter::new(context.clone()), dispatcher.clone()),
        );

        let workers = [minute.clone(), hour, day, month].map(|handle| {
            let interval = config.aggregator_config(handle.granularity()).flush_interval();
            let flush = runner.start(AggregatorService::new(handle.clone(), interval));
            Worker { handle, flush }
        });

        let registry = IdentityRegistry::start(identities, runner);
        let inbound = InboundHandler::new(Arc::new(minute.clone()));
        let ingestor = Ingestor::new(minute);

        tally_log::info!(
            node = %context.self_node(),
            members = context.members().len(),
            "started aggregation pipeline"
        );

        Self {
            config,
            context,
            workers: Arc::new(workers),
            ingestor,
            inbound,
            dispatcher,
            persistence,
            registry,
        }
    }

    /// Returns the configuration of this pipeline.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the shared cluster context.
    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.context
    }

    /// Returns the identity registry used to resolve entity ids before observing.
    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    /// Returns the handler for batches dispatched to this node by its peers.
    pub fn inbound(&self) -> &InboundHandler {
        &self.inbound
    }

    /// Returns the worker of a granularity.
    pub fn worker(&self, granularity: Granularity) -> &WorkerHandle {
        let index = match granularity {
            Granularity::Minute => 0,
            Granularity::Hour => 1,
            Granularity::Day => 2,
            Granularity::Month => 3,
        };
        &self.workers[index].handle
    }

    /// Accepts a sample into the pipeline.
    pub fn observe(&self, sample: Sample) -> Ingested {
        self.ingestor.observe(sample)
    }

    /// Applies member lists from `feed` to the cluster context until the feed closes.
    pub fn follow_membership(
        &self,
        feed: watch::Receiver<Vec<NodeAddress>>,
        runner: &mut ServiceRunner,
    ) {
        runner.start(MembershipService::new(self.context.clone(), feed));
    }

    /// Removes persisted metrics older than the configured retention.
    ///
    /// Resolves to the number of removed metrics.
    pub fn sweep_history(&self, now: UnixTimestamp) -> Request<usize> {
        self.persistence.send(SweepHistory { now })
    }

    /// Flushes the whole pipeline.
    ///
    /// Every worker is drained in chain order so that downsampled metrics reach the coarser
    /// workers before those are drained. Metrics owned by peers are delivered right after the
    /// minute worker was drained. Resolves once all resulting writes have completed, with the
    /// total number of drained metrics.
    ///
    /// Peers receiving dispatched metrics must be flushed separately.
    pub async fn flush_now(&self, now: UnixTimestamp) -> Result<usize, SendError> {
        let mut flushed = 0;
        for (index, worker) in self.workers.iter().enumerate() {
            flushed += worker.flush.send(FlushAggregator { now }).await?;
            if index == 0 {
                self.dispatcher.send(FlushDispatch).await?;
            }
        }

        self.persistence.send(SyncPersistence).await?;
        Ok(flushed)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("node", self.context.self_node())
            .field("workers", &self.workers.len())
            .field("registry", &self.registry)
            .finish()
    }
}
