//! Metric entities and their aggregation.
//!
//! This crate defines the aggregatable [`Metric`] entity and the in-process [`Aggregator`] that
//! merges metrics of one granularity between two flushes.
//!
//! # Metric Entities
//!
//! A metric is identified by its [`MetricKey`], which consists of a [`MetricName`], the
//! [`EntityId`] of the service, instance or endpoint it describes, and a [`TimeBucket`]. Metrics
//! with equal keys describe the same logical metric and are merged:
//!
//! ```
//! use tally_common::time::UnixTimestamp;
//! use tally_metrics::{EntityId, Metric, MetricName, Observation};
//!
//! let name = MetricName::new("service_cpm").unwrap();
//! let timestamp = UnixTimestamp::from_secs(1709212020);
//!
//! let mut metric = Metric::from_observation(
//!     name.clone(),
//!     EntityId::from("svc"),
//!     timestamp,
//!     Observation::Cpm(3),
//! )
//! .unwrap();
//!
//! let other =
//!     Metric::from_observation(name, EntityId::from("svc"), timestamp, Observation::Cpm(2))
//!         .unwrap();
//!
//! metric.merge(other).unwrap();
//! metric.finalize();
//! assert_eq!(metric.value.value(), Some(5));
//! ```
//!
//! # Time Buckets
//!
//! Every metric lives in a calendar-aligned [`TimeBucket`] at one of four [granularities]:
//! minute, hour, day and month. Metrics are ingested at minute granularity and then
//! [downsampled](Metric::downsample) along the chain to coarser granularities.
//!
//! # Flat Records
//!
//! [`Metric::to_record`] and [`Metric::from_record`] convert metrics to and from a [`FlatRecord`],
//! an ordered list of integer and text fields. This representation is shared by the cluster
//! transport and the storage mapping.
//!
//! [granularities]: Granularity

#![warn(missing_docs)]

pub mod aggregator;
pub mod record;

mod metric;
mod protocol;
mod statsd;
mod time;
mod value;

pub use self::aggregator::{Accepted, AggregateMetricsError, Aggregator, AggregatorConfig};
pub use self::metric::*;
pub use self::protocol::*;
pub use self::record::{Field, FlatRecord};
pub use self::time::*;
pub use self::value::*;
