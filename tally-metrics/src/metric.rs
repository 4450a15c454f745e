use std::hash::Hash;

use serde::{Deserialize, Serialize};
use tally_common::time::UnixTimestamp;

use crate::aggregator::AggregateMetricsError;
use crate::protocol::{EntityId, MetricId, MetricKey, MetricName, ParseMetricError};
use crate::record::FlatRecord;
use crate::time::{Granularity, TimeBucket};
use crate::value::{MetricKind, MetricValue, Observation};

/// Hash function used to assign metrics to cluster members.
///
/// All nodes of a cluster must use the same algorithm, otherwise they disagree on ownership.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// 32-bit FNV-1a.
    #[default]
    Fnv,
    /// 32-bit MurmurHash3.
    Murmur3,
}

/// An aggregatable metric entity.
///
/// A metric is identified by its [`MetricKey`] and carries kind-specific raw state in its
/// [`MetricValue`]. Metrics with the same key are merged by the aggregator, finalized once per
/// flush, and downsampled into fresh entities at coarser granularities.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Metric {
    /// The identity of this metric.
    pub key: MetricKey,
    /// The raw state.
    pub value: MetricValue,
}

impl Metric {
    /// Creates a metric from its parts.
    pub fn new(key: MetricKey, value: MetricValue) -> Self {
        Self { key, value }
    }

    /// Creates a minute metric from a single observation.
    pub fn from_observation(
        name: MetricName,
        entity_id: EntityId,
        timestamp: UnixTimestamp,
        observation: Observation,
    ) -> Result<Self, ParseMetricError> {
        let time_bucket = TimeBucket::from_timestamp(timestamp, Granularity::Minute)
            .ok_or(ParseMetricError::InvalidTimestamp(timestamp))?;

        Ok(Self {
            key: MetricKey::new(name, entity_id, time_bucket),
            value: MetricValue::from_observation(observation),
        })
    }

    /// Returns the derived string identifier.
    pub fn id(&self) -> MetricId {
        self.key.id()
    }

    /// Returns the metric kind.
    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    /// Returns the metric name.
    pub fn name(&self) -> &MetricName {
        &self.key.name
    }

    /// Returns the entity this metric describes.
    pub fn entity_id(&self) -> &EntityId {
        &self.key.entity_id
    }

    /// Returns the time bucket.
    pub fn time_bucket(&self) -> TimeBucket {
        self.key.time_bucket
    }

    /// Returns the granularity of the time bucket.
    pub fn granularity(&self) -> Granularity {
        self.key.granularity()
    }

    /// Merges another instance of the same metric into this one.
    ///
    /// Both metrics must have the same key and kind. On error, `self` is left untouched and
    /// `other` is discarded.
    pub fn merge(&mut self, other: Metric) -> Result<(), AggregateMetricsError> {
        if self.key != other.key {
            return Err(AggregateMetricsError::MismatchedIds {
                expected: self.id(),
                found: other.id(),
            });
        }

        let expected = self.kind();
        self.value.merge(other.value).map_err(|value| {
            let found = value.kind();
            if found == expected {
                AggregateMetricsError::IncompatibleValues(expected)
            } else {
                AggregateMetricsError::InvalidTypes { expected, found }
            }
        })
    }

    /// Computes the exposed value from the raw state. Idempotent.
    pub fn finalize(&mut self) {
        self.value.finalize(self.key.time_bucket);
    }

    /// Creates a copy of this metric at a coarser granularity.
    ///
    /// The copy has the same name, entity and raw payload, but the time bucket is truncated to
    /// `granularity`. Fails if `granularity` is not strictly coarser than the current one.
    pub fn downsample(&self, granularity: Granularity) -> Result<Metric, AggregateMetricsError> {
        let from = self.granularity();
        let time_bucket = self
            .key
            .time_bucket
            .to_granularity(granularity)
            .filter(|_| granularity > from)
            .ok_or(AggregateMetricsError::InvalidGranularity {
                from,
                to: granularity,
            })?;

        Ok(Self {
            key: self.key.with_time_bucket(time_bucket),
            value: self.value.clone(),
        })
    }

    /// Returns a 32-bit hash over the entity id and name.
    ///
    /// The time bucket is not part of the hash, so all buckets of one metric series are owned by
    /// the same cluster member. The hash is computed over bytes and therefore identical on every
    /// platform.
    pub fn partition_hash(&self, algorithm: HashAlgorithm) -> u32 {
        match algorithm {
            HashAlgorithm::Fnv => self.hash_series(hash32::FnvHasher::default()),
            HashAlgorithm::Murmur3 => self.hash_series(hash32::Murmur3Hasher::default()),
        }
    }

    fn hash_series<H: hash32::Hasher>(&self, mut hasher: H) -> u32 {
        self.key.entity_id.as_str().hash(&mut hasher);
        self.key.name.as_str().hash(&mut hasher);
        hasher.finish32()
    }

    /// Serializes this metric into a flat record.
    ///
    /// See the [`record`](crate::record) module for the layout.
    pub fn to_record(&self) -> FlatRecord {
        let mut record = FlatRecord::new();
        record.push(self.kind().as_str());
        record.push(self.key.name.as_str());
        record.push(self.key.entity_id.as_str());
        record.push(self.key.time_bucket.as_u64() as i64);
        self.value.write_fields(&mut record);
        record
    }

    /// Parses a metric from a flat record.
    ///
    /// Records with an unknown kind tag, a malformed payload or the unknown entity sentinel are
    /// rejected.
    pub fn from_record(record: &FlatRecord) -> Result<Self, ParseMetricError> {
        let mut reader = record.reader();

        let kind = reader.text("kind")?.parse::<MetricKind>()?;
        let name = MetricName::new(reader.text("name")?)?;

        let entity_id = EntityId::from(reader.text("entity_id")?);
        if entity_id.is_unknown() {
            return Err(ParseMetricError::InvalidField("entity_id"));
        }

        let time_bucket = u64::try_from(reader.int("time_bucket")?)
            .map_err(|_| ParseMetricError::InvalidField("time_bucket"))
            .and_then(TimeBucket::parse)?;

        let value = MetricValue::read_fields(kind, &mut reader)?;
        reader.finish()?;

        Ok(Self {
            key: MetricKey::new(name, entity_id, time_bucket),
            value,
        })
    }
}
