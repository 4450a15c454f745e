use std::sync::Arc;

use tally_metrics::Metric;

use crate::context::{ClusterContext, NodeAddress};

/// The destination of a metric as decided by the [`ShardRouter`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Route {
    /// This node owns the metric and finalizes it.
    Local,
    /// Another member owns the metric, it must be dispatched to that node unfinalized.
    Remote(NodeAddress),
}

/// Assigns metrics to their owning cluster member.
///
/// The owner of a metric is `members[hash(entity_id, name) % members.len()]` over the canonical
/// member list. Ownership is never stored: every node derives it from the same member list and
/// hash algorithm, so all nodes agree without coordination.
///
/// When the membership changes, ownership is recomputed for new metrics only. Metrics already
/// accumulated on the previous owner are flushed from there, so a metric may be split across two
/// nodes for one window. Storage merges both writes.
#[derive(Clone, Debug)]
pub struct ShardRouter {
    context: Arc<ClusterContext>,
}

impl ShardRouter {
    /// Creates a router on top of the shared cluster context.
    pub fn new(context: Arc<ClusterContext>) -> Self {
        Self { context }
    }

    /// Returns the cluster context.
    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.context
    }

    /// Returns the member owning the given metric.
    ///
    /// Returns `None` if the membership is empty.
    pub fn owner(&self, metric: &Metric) -> Option<NodeAddress> {
        let members = self.context.members();
        if members.is_empty() {
            return None;
        }

        let hash = metric.partition_hash(self.context.hash_algorithm());
        let index = hash as usize % members.len();
        members.get(index).cloned()
    }

    /// Decides whether the metric is handled locally or dispatched to a peer.
    ///
    /// With an empty membership, everything is handled locally.
    pub fn route(&self, metric: &Metric) -> Route {
        match self.owner(metric) {
            Some(owner) if owner != *self.context.self_node() => Route::Remote(owner),
            _ => Route::Local,
        }
    }
}

#[cfg(test)]
mod tests {
    use tally_common::time::UnixTimestamp;
    use tally_metrics::{EntityId, HashAlgorithm, MetricName, Observation};

    use super::*;

    fn nodes(addresses: &[&str]) -> Vec<NodeAddress> {
        addresses.iter().copied().map(NodeAddress::from).collect()
    }

    fn metric(name: &str, entity: &str) -> Metric {
        Metric::from_observation(
            MetricName::new(name).unwrap(),
            EntityId::from(entity),
            UnixTimestamp::from_secs(1709212020),
            Observation::Count(1),
        )
        .unwrap()
    }

    #[test]
    fn test_ownership_agrees_across_nodes() {
        let members = ["n1:1", "n2:1", "n3:1", "n4:1", "n5:1"];

        // Every node sees the member list in a different order.
        let routers: Vec<_> = (0..members.len())
            .map(|i| {
                let mut list = nodes(&members);
                list.rotate_left(i);
                let context = ClusterContext::new(list[0].clone(), list, HashAlgorithm::Fnv);
                ShardRouter::new(Arc::new(context))
            })
            .collect();

        for i in 0..1000 {
            let metric = metric(&format!("metric_{}", i % 7), &format!("entity{i}"));
            let owners: Vec<_> = routers.iter().map(|r| r.owner(&metric)).collect();
            assert!(owners.windows(2).all(|w| w[0] == w[1]), "{owners:?}");

            // Exactly one router considers itself the owner.
            let local = routers
                .iter()
                .filter(|r| r.route(&metric) == Route::Local)
                .count();
            assert_eq!(local, 1);
        }
    }

    #[test]
    fn test_bucket_does_not_affect_owner() {
        let context = ClusterContext::new(
            "n1:1".into(),
            nodes(&["n1:1", "n2:1", "n3:1"]),
            HashAlgorithm::Murmur3,
        );
        let router = ShardRouter::new(Arc::new(context));

        let minute = metric("service_cpm", "svc");
        let hour = minute.downsample(tally_metrics::Granularity::Hour).unwrap();
        assert_eq!(router.owner(&minute), router.owner(&hour));
    }

    #[test]
    fn test_empty_membership_routes_locally() {
        let router = ShardRouter::new(Arc::new(ClusterContext::standalone("n1:1".into())));
        let metric = metric("service_cpm", "svc");

        assert_eq!(router.owner(&metric), None);
        assert_eq!(router.route(&metric), Route::Local);
    }

    #[test]
    fn test_membership_change_reroutes_new_metrics() {
        let context = Arc::new(ClusterContext::new(
            "n1:1".into(),
            nodes(&["n1:1", "n2:1"]),
            HashAlgorithm::Fnv,
        ));
        let router = ShardRouter::new(context.clone());

        context.update_members(nodes(&["n1:1"]));
        for i in 0..100 {
            assert_eq!(router.route(&metric("service_cpm", &format!("e{i}"))), Route::Local);
        }
    }
}
