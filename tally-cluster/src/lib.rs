//! Shard routing and remote dispatch between cluster members.
//!
//! Every metric has exactly one owner in the cluster, determined by the [`ShardRouter`] from the
//! metric's partition hash and the current member list in the [`ClusterContext`]. Observations are
//! first merged by the local worker of the node that received them. When that worker is flushed,
//! metrics owned by this node are finalized locally, all others are handed to the
//! [`RemoteDispatcherService`], which batches them per destination and delivers them through a
//! [`ClusterTransport`]. On the receiving side, the [`InboundHandler`] decodes batches and accepts
//! them into the local worker of that node, where they are merged a second time.

#![warn(missing_docs)]

mod config;
mod context;
mod dispatcher;
mod inbound;
mod router;
mod statsd;
mod transport;

pub use self::config::*;
pub use self::context::*;
pub use self::dispatcher::*;
pub use self::inbound::*;
pub use self::router::*;
pub use self::transport::*;
