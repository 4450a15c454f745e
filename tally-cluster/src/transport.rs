use std::future::Future;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tally_metrics::{FlatRecord, Metric};

use crate::context::NodeAddress;
use crate::inbound::InboundHandler;

/// An error returned by a [`ClusterTransport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The destination is not known to the transport or does not accept connections.
    #[error("node {0} is unreachable")]
    Unreachable(NodeAddress),
    /// The attempt did not complete in time.
    #[error("request timed out")]
    Timeout,
    /// The batch could not be encoded or decoded.
    #[error("invalid batch payload")]
    Payload(#[from] serde_json::Error),
    /// The peer received the batch but refused it.
    #[error("batch rejected by peer: {0}")]
    Rejected(String),
}

/// A batch of metrics sent to the owning peer.
///
/// Metrics are carried as [`FlatRecord`]s. Byte transports encode the batch as JSON, see
/// [`RemoteBatch::to_json`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct RemoteBatch {
    /// The encoded metrics.
    pub records: Vec<FlatRecord>,
}

impl RemoteBatch {
    /// Encodes a list of metrics.
    pub fn from_metrics<'a>(metrics: impl IntoIterator<Item = &'a Metric>) -> Self {
        Self {
            records: metrics.into_iter().map(Metric::to_record).collect(),
        }
    }

    /// Returns the number of records in this batch.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if the batch contains no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serializes the batch into JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, TransportError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a batch from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, TransportError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Sends batches of metrics to other cluster members.
///
/// Implementations must not retry internally; the dispatcher applies timeouts and retries around
/// every call to [`send`](Self::send).
pub trait ClusterTransport: Send + Sync + 'static {
    /// Delivers a batch to the given node.
    fn send(
        &self,
        node: &NodeAddress,
        batch: RemoteBatch,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// An in-process transport connecting nodes that run in the same process.
///
/// Every node registers its [`InboundHandler`] under its address. Batches are encoded to JSON and
/// decoded again on delivery, exactly as a network transport would.
#[derive(Clone, Debug, Default)]
pub struct LocalTransport {
    peers: Arc<RwLock<HashMap<NodeAddress, InboundHandler>>>,
}

impl LocalTransport {
    /// Creates a transport without any registered nodes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the inbound handler of a node.
    pub fn register(&self, node: NodeAddress, handler: InboundHandler) {
        self.peers.write().insert(node, handler);
    }

    /// Removes a node, subsequent sends to it fail with [`TransportError::Unreachable`].
    pub fn unregister(&self, node: &NodeAddress) {
        self.peers.write().remove(node);
    }
}

impl ClusterTransport for LocalTransport {
    fn send(
        &self,
        node: &NodeAddress,
        batch: RemoteBatch,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let handler = self.peers.read().get(node).cloned();
        let node = node.clone();

        async move {
            let handler = handler.ok_or(TransportError::Unreachable(node))?;
            let bytes = batch.to_json()?;
            handler.receive_bytes(&bytes)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use tally_common::time::UnixTimestamp;
    use tally_metrics::{EntityId, MetricName, Observation};

    use super::*;
    use crate::inbound::LocalWorker;

    #[derive(Default)]
    struct CollectingWorker(Mutex<Vec<Metric>>);

    impl LocalWorker for CollectingWorker {
        fn accept(&self, metric: Metric) {
            self.0.lock().push(metric);
        }
    }

    fn metric(entity: &str) -> Metric {
        Metric::from_observation(
            MetricName::new("service_cpm").unwrap(),
            EntityId::from(entity),
            UnixTimestamp::from_secs(1709212020),
            Observation::Cpm(1),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_local_delivery() {
        let worker = Arc::new(CollectingWorker::default());
        let transport = LocalTransport::new();
        transport.register("n2:1".into(), InboundHandler::new(worker.clone()));

        let metrics = [metric("a"), metric("b")];
        transport
            .send(&"n2:1".into(), RemoteBatch::from_metrics(&metrics))
            .await
            .unwrap();

        assert_eq!(*worker.0.lock(), metrics);
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let transport = LocalTransport::new();
        let result = transport
            .send(&"n9:1".into(), RemoteBatch::from_metrics(&[metric("a")]))
            .await;

        assert!(matches!(result, Err(TransportError::Unreachable(node)) if node.as_str() == "n9:1"));
    }

    #[test]
    fn test_batch_json() {
        let batch = RemoteBatch::from_metrics(&[metric("a")]);
        let bytes = batch.to_json().unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"records":[["cpm","service_cpm","a",202402291307,1,0]]}"#
        );
        assert_eq!(RemoteBatch::from_json(&bytes).unwrap(), batch);
    }
}
