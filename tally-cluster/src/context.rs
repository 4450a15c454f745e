use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tally_metrics::HashAlgorithm;

/// The address of a cluster member, typically `host:port`.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(transparent)]
pub struct NodeAddress(Arc<str>);

impl NodeAddress {
    /// Creates a node address from its string form.
    pub fn new(address: impl Into<Arc<str>>) -> Self {
        Self(address.into())
    }

    /// Returns the address as string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({})", self.0)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for NodeAddress {
    fn from(address: String) -> Self {
        Self::new(address)
    }
}

/// Sorts and deduplicates a member list so that every node derives the same order.
fn canonicalize(members: impl IntoIterator<Item = NodeAddress>) -> Vec<NodeAddress> {
    let mut members: Vec<_> = members.into_iter().collect();
    members.sort_unstable();
    members.dedup();
    members
}

/// Cluster state shared by all components of a node.
///
/// The context is created once at startup and passed around as `Arc<ClusterContext>`. The
/// membership snapshot is replaced atomically whenever the membership feed reports a change;
/// readers always see a complete, canonical member list.
#[derive(Debug)]
pub struct ClusterContext {
    self_node: NodeAddress,
    members: ArcSwap<Vec<NodeAddress>>,
    hash_algorithm: HashAlgorithm,
}

impl ClusterContext {
    /// Creates a context with an initial member list.
    pub fn new(
        self_node: NodeAddress,
        members: impl IntoIterator<Item = NodeAddress>,
        hash_algorithm: HashAlgorithm,
    ) -> Self {
        Self {
            self_node,
            members: ArcSwap::from_pointee(canonicalize(members)),
            hash_algorithm,
        }
    }

    /// Creates a context without peers, which keeps all metrics local.
    pub fn standalone(self_node: NodeAddress) -> Self {
        Self::new(self_node, [], HashAlgorithm::default())
    }

    /// Returns the address of this node.
    pub fn self_node(&self) -> &NodeAddress {
        &self.self_node
    }

    /// Returns the hash algorithm used to assign metrics to members.
    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash_algorithm
    }

    /// Returns the current canonical member list.
    pub fn members(&self) -> Arc<Vec<NodeAddress>> {
        self.members.load_full()
    }

    /// Replaces the member list.
    ///
    /// Returns `true` if the canonical member list changed.
    pub fn update_members(&self, members: impl IntoIterator<Item = NodeAddress>) -> bool {
        let members = canonicalize(members);
        if **self.members.load() == members {
            return false;
        }

        tally_log::info!(
            members = members.len(),
            "cluster membership changed, new metrics are routed with the updated member list"
        );
        self.members.store(Arc::new(members));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(addresses: &[&str]) -> Vec<NodeAddress> {
        addresses.iter().copied().map(NodeAddress::from).collect()
    }

    #[test]
    fn test_canonical_members() {
        let context = ClusterContext::new(
            "b:1".into(),
            nodes(&["c:1", "a:1", "b:1", "a:1"]),
            HashAlgorithm::Fnv,
        );

        assert_eq!(*context.members(), nodes(&["a:1", "b:1", "c:1"]));
    }

    #[test]
    fn test_update_members() {
        let context = ClusterContext::new("a:1".into(), nodes(&["a:1", "b:1"]), HashAlgorithm::Fnv);

        assert!(!context.update_members(nodes(&["b:1", "a:1"])));
        assert!(context.update_members(nodes(&["b:1"])));
        assert_eq!(*context.members(), nodes(&["b:1"]));
    }

    #[test]
    fn test_node_address_serde() {
        let node: NodeAddress = serde_json::from_str(r#""10.0.0.1:11800""#).unwrap();
        assert_eq!(node.as_str(), "10.0.0.1:11800");
        assert_eq!(format!("{node:?}"), "NodeAddress(10.0.0.1:11800)");
    }
}
