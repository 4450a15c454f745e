use std::fmt;
use std::sync::Arc;

use tally_log::LogError;
use tally_metrics::Metric;
use tally_statsd::metric;

use crate::statsd::ClusterCounters;
use crate::transport::{RemoteBatch, TransportError};

/// The local minute worker as seen by the cluster layer.
///
/// Implementations accept a metric exactly as if it was produced on this node. Errors are handled
/// by the implementation.
pub trait LocalWorker: Send + Sync + 'static {
    /// Accepts a metric owned by this node.
    fn accept(&self, metric: Metric);
}

/// Receives batches dispatched by peers and feeds them into the local worker.
#[derive(Clone)]
pub struct InboundHandler {
    worker: Arc<dyn LocalWorker>,
}

impl InboundHandler {
    /// Creates a handler that accepts into the given worker.
    pub fn new(worker: Arc<dyn LocalWorker>) -> Self {
        Self { worker }
    }

    /// Decodes every record of the batch and accepts it into the local worker.
    ///
    /// Records that cannot be decoded are logged and discarded individually, the rest of the
    /// batch is still accepted. Returns the number of accepted metrics.
    pub fn receive(&self, batch: RemoteBatch) -> usize {
        let mut accepted = 0;

        for record in &batch.records {
            match Metric::from_record(record) {
                Ok(metric) => {
                    self.worker.accept(metric);
                    accepted += 1;
                }
                Err(error) => {
                    tally_log::error!(
                        error = &error as &dyn std::error::Error,
                        "discarding undecodable metric record from peer"
                    );
                    metric!(counter(ClusterCounters::InboundRejected) += 1);
                }
            }
        }

        metric!(counter(ClusterCounters::InboundAccepted) += accepted as i64);
        accepted
    }

    /// Decodes a JSON encoded batch and passes it to [`receive`](Self::receive).
    pub fn receive_bytes(&self, bytes: &[u8]) -> Result<usize, TransportError> {
        match RemoteBatch::from_json(bytes) {
            Ok(batch) => Ok(self.receive(batch)),
            Err(error) => {
                tally_log::error!("failed to decode batch from peer: {}", LogError(&error));
                Err(error)
            }
        }
    }
}

impl fmt::Debug for InboundHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundHandler").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use tally_common::time::UnixTimestamp;
    use tally_metrics::{EntityId, Field, FlatRecord, MetricName, Observation};

    use super::*;

    #[derive(Default)]
    struct CollectingWorker(Mutex<Vec<Metric>>);

    impl LocalWorker for CollectingWorker {
        fn accept(&self, metric: Metric) {
            self.0.lock().push(metric);
        }
    }

    #[test]
    fn test_undecodable_records_are_skipped() {
        tally_test::setup();

        let worker = Arc::new(CollectingWorker::default());
        let handler = InboundHandler::new(worker.clone());

        let metric = Metric::from_observation(
            MetricName::new("service_cpm").unwrap(),
            EntityId::from("svc"),
            UnixTimestamp::from_secs(1709212020),
            Observation::Cpm(3),
        )
        .unwrap();

        let broken = FlatRecord::from(vec![Field::from("p42"), Field::from("service_cpm")]);
        let batch = RemoteBatch {
            records: vec![broken, metric.to_record()],
        };

        assert_eq!(handler.receive(batch), 1);
        assert_eq!(*worker.0.lock(), vec![metric]);
    }

    #[test]
    fn test_invalid_json() {
        tally_test::setup();

        let handler = InboundHandler::new(Arc::new(CollectingWorker::default()));
        assert!(matches!(
            handler.receive_bytes(b"{not json"),
            Err(TransportError::Payload(_))
        ));
    }
}
