use std::sync::Arc;

use tally_cluster::{ClusterContext, NodeAddress};
use tally_statsd::metric;
use tally_system::{Controller, Receiver, Service};
use tokio::sync::watch;

use crate::statsd::ServerCounters;

/// Applies member lists from a membership feed to the shared [`ClusterContext`].
///
/// The feed is a [`watch`] channel carrying the full member list. The current value of the feed
/// is applied on start. The service stops when the feed closes or on shutdown.
#[derive(Debug)]
pub struct MembershipService {
    context: Arc<ClusterContext>,
    feed: watch::Receiver<Vec<NodeAddress>>,
}

impl MembershipService {
    /// Creates a service updating `context` from `feed`.
    pub fn new(context: Arc<ClusterContext>, feed: watch::Receiver<Vec<NodeAddress>>) -> Self {
        Self { context, feed }
    }

    fn apply(&mut self) {
        let members = self.feed.borrow_and_update().clone();
        let count = members.len();

        if self.context.update_members(members) {
            tally_log::info!(members = count, "applied cluster membership update");
            metric!(counter(ServerCounters::MembershipChanged) += 1);
        }
    }
}

impl Service for MembershipService {
    type Interface = ();

    async fn run(mut self, _rx: Receiver<Self::Interface>) {
        let mut shutdown = Controller::shutdown_handle();
        self.apply();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => break,
                changed = self.feed.changed() => match changed {
                    Ok(()) => self.apply(),
                    Err(_) => {
                        tally_log::debug!("membership feed closed");
                        break;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(addresses: &[&str]) -> Vec<NodeAddress> {
        addresses.iter().copied().map(NodeAddress::from).collect()
    }

    #[tokio::test]
    async fn test_applies_feed() {
        tally_test::setup();
        let context = Arc::new(ClusterContext::standalone(NodeAddress::from("node-a")));
        let (tx, rx) = watch::channel(nodes(&["node-a"]));

        let service = MembershipService::new(context.clone(), rx);
        let handle = tokio::spawn(service.run(tally_system::channel("membership").1));
        tokio::task::yield_now().await;

        tx.send(nodes(&["node-b", "node-a"])).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(*context.members(), nodes(&["node-a", "node-b"]));
    }
}
