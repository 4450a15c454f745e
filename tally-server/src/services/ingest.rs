use tally_common::time::UnixTimestamp;
use tally_metrics::{EntityId, Metric, MetricName, Observation};
use tally_statsd::metric;

use crate::services::aggregator::WorkerHandle;
use crate::statsd::ServerCounters;

/// A single observation reported by an agent or ingest node.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// The name of the observed metric.
    pub name: MetricName,
    /// The entity the observation belongs to, as returned by the identity registry.
    pub entity_id: EntityId,
    /// The time of the observation.
    pub timestamp: UnixTimestamp,
    /// The kind-specific raw value.
    pub observation: Observation,
}

/// Whether a sample entered the pipeline in [`Ingestor::observe`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Ingested {
    /// Accepted into the local minute worker.
    Accepted,
    /// Dropped before aggregation.
    Dropped,
}

/// The ingestion boundary of the pipeline.
///
/// Turns samples into minute metrics and accepts them into the local minute worker, regardless
/// of which cluster member owns them. Ownership is resolved when the worker is flushed.
#[derive(Clone, Debug)]
pub struct Ingestor {
    minute: WorkerHandle,
}

impl Ingestor {
    /// Creates an ingestor feeding the given minute worker.
    pub fn new(minute: WorkerHandle) -> Self {
        Self { minute }
    }

    /// Accepts a sample into the pipeline.
    ///
    /// Samples for the unknown entity are dropped, the caller retries once the identity was
    /// created. Samples that do not form a valid metric are logged and dropped.
    pub fn observe(&self, sample: Sample) -> Ingested {
        let Sample {
            name,
            entity_id,
            timestamp,
            observation,
        } = sample;

        if entity_id.is_unknown() {
            metric!(
                counter(ServerCounters::SampleDropped) += 1,
                reason = "unknown_entity",
            );
            return Ingested::Dropped;
        }

        match Metric::from_observation(name, entity_id, timestamp, observation) {
            Ok(metric) => {
                self.minute.accept(metric);
                Ingested::Accepted
            }
            Err(error) => {
                tally_log::debug!(
                    error = &error as &dyn std::error::Error,
                    "dropping invalid sample"
                );
                metric!(counter(ServerCounters::SampleDropped) += 1, reason = "invalid");
                Ingested::Dropped
            }
        }
    }
}
