//! The streaming aggregation pipeline of a Tally node.
//!
//! Agents and ingest nodes report high-frequency observations for services, instances and
//! endpoints. The pipeline turns them into time-bucketed metrics at four granularities and
//! persists them:
//!
//!  1. [`Pipeline::observe`] constructs a minute metric from a [`Sample`](services::ingest::Sample)
//!     and accepts it into the local minute worker, merging it with all other observations of the
//!     same metric, entity and minute.
//!  2. When the minute worker is flushed, metrics owned by another cluster member are sent to
//!     that member, which merges them into its own minute worker.
//!  3. Each worker is flushed on its own interval. Flushed metrics owned by this node are
//!     finalized, written to the [`StorageSink`](storage::StorageSink) and downsampled into the
//!     next coarser worker: minute, hour, day, month.
//!
//! Entity ids are resolved through the [`IdentityRegistry`](tally_registry::IdentityRegistry)
//! before samples are observed. Samples for entities without a confirmed id are dropped.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tally_cluster::LocalTransport;
//! use tally_common::time::UnixTimestamp;
//! use tally_config::Config;
//! use tally_metrics::{MetricName, Observation};
//! use tally_registry::{MemoryIdentitySink, Scope};
//! use tally_server::services::ingest::Sample;
//! use tally_server::storage::MemoryStorage;
//! use tally_server::Pipeline;
//! use tally_system::ServiceRunner;
//!
//! # async fn run() {
//! let mut runner = ServiceRunner::new();
//! let pipeline = Pipeline::start(
//!     Arc::new(Config::default()),
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(MemoryIdentitySink::new()),
//!     Arc::new(LocalTransport::new()),
//!     &mut runner,
//! );
//!
//! let entity_id = pipeline.registry().get_or_create("checkout", Scope::Service);
//! pipeline.observe(Sample {
//!     name: MetricName::new("service_cpm").unwrap(),
//!     entity_id,
//!     timestamp: UnixTimestamp::now(),
//!     observation: Observation::Cpm(1),
//! });
//! # }
//! ```
#![warn(missing_docs)]

pub mod services;
pub mod setup;
pub mod storage;

mod service;
mod statsd;

pub use self::service::Pipeline;
