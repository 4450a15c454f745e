//! Services and workers of the aggregation pipeline.
//!
//! Samples enter through the [`Ingestor`](ingest::Ingestor), which accepts them into the local
//! minute worker. Each granularity has a [`WorkerHandle`](aggregator::WorkerHandle) flushed by its
//! own [`AggregatorService`](aggregator::AggregatorService). The minute worker hands flushed
//! metrics owned by peers to the remote dispatcher. All other flushed metrics are downsampled into
//! the next coarser worker and written by the
//! [`PersistenceService`](persistence::PersistenceService).

pub mod aggregator;
pub mod downsampling;
pub mod ingest;
pub mod membership;
pub mod persistence;
