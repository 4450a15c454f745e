//! Identifiers of metric entities.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tally_common::time::UnixTimestamp;

use crate::time::{Granularity, TimeBucket};

/// The maximum length of a metric name in bytes.
pub const MAX_NAME_LENGTH: usize = 200;

/// An error returned when metrics or their identifiers cannot be parsed.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ParseMetricError {
    /// The metric name is empty, too long or contains invalid characters.
    #[error("invalid metric name {0:?}")]
    InvalidName(String),
    /// The encoded time bucket is not a valid calendar position.
    #[error("invalid time bucket {0}")]
    InvalidTimeBucket(u64),
    /// The timestamp cannot be placed in a time bucket.
    #[error("timestamp {0} is out of range")]
    InvalidTimestamp(UnixTimestamp),
    /// The kind tag does not name a known metric kind.
    #[error("unknown metric kind {0:?}")]
    UnknownKind(String),
    /// The granularity name is not known.
    #[error("unknown granularity")]
    UnknownGranularity,
    /// A required field of a flat record is missing.
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    /// A field of a flat record has the wrong type or an invalid value.
    #[error("invalid field `{0}`")]
    InvalidField(&'static str),
    /// A flat record contains more fields than its kind defines.
    #[error("unexpected trailing fields")]
    TrailingFields,
}

/// The validated name of a metric.
///
/// Names are non-empty, at most [`MAX_NAME_LENGTH`] bytes long and consist of ASCII letters,
/// digits and underscores.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MetricName(Arc<str>);

impl MetricName {
    /// Validates and creates a metric name.
    pub fn new(name: impl Into<String>) -> Result<Self, ParseMetricError> {
        let name = name.into();

        let is_valid = !name.is_empty()
            && name.len() <= MAX_NAME_LENGTH
            && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');

        if !is_valid {
            return Err(ParseMetricError::InvalidName(name));
        }

        Ok(Self(name.into()))
    }

    /// Returns the name as string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for MetricName {
    type Err = ParseMetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for MetricName {
    type Error = ParseMetricError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MetricName> for String {
    fn from(name: MetricName) -> Self {
        name.0.as_ref().to_owned()
    }
}

/// The stable identifier of a service, instance or endpoint.
///
/// Entity ids are minted by the identity registry. The empty id is reserved as the
/// [unknown](Self::unknown) sentinel, which is handed out while the registry has not yet confirmed
/// an identity. Metrics carrying the sentinel are never persisted.
#[derive(Clone, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Arc<str>);

impl EntityId {
    /// Creates an entity id from its string form.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the sentinel for identities that have not been confirmed yet.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Returns `true` if this is the [unknown](Self::unknown) sentinel.
    pub fn is_unknown(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the id as string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            f.write_str("EntityId(<unknown>)")
        } else {
            write!(f, "EntityId({})", self.0)
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// The identity of a metric entity.
///
/// Two metrics with equal keys describe the same logical metric and must be merged.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MetricKey {
    /// The metric name.
    pub name: MetricName,
    /// The entity the metric describes.
    pub entity_id: EntityId,
    /// The time bucket the metric covers.
    pub time_bucket: TimeBucket,
}

impl MetricKey {
    /// Creates a new metric key.
    pub fn new(name: MetricName, entity_id: EntityId, time_bucket: TimeBucket) -> Self {
        Self {
            name,
            entity_id,
            time_bucket,
        }
    }

    /// Returns the granularity of the time bucket.
    pub fn granularity(&self) -> Granularity {
        self.time_bucket.granularity()
    }

    /// Returns the derived string identifier.
    pub fn id(&self) -> MetricId {
        MetricId(format!(
            "{}:{}_{}",
            self.name, self.time_bucket, self.entity_id
        ))
    }

    /// Returns the same key moved to another time bucket.
    pub fn with_time_bucket(&self, time_bucket: TimeBucket) -> Self {
        Self {
            time_bucket,
            ..self.clone()
        }
    }
}

/// The string identifier of a metric entity, `"{name}:{time_bucket}_{entity_id}"`.
///
/// Metric names cannot contain `:` and time buckets consist only of digits, so distinct keys
/// never produce the same identifier.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricId(String);

impl MetricId {
    /// Returns the identifier as string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_name_validation() {
        assert!(MetricName::new("service_resp_time").is_ok());
        assert!(MetricName::new("endpoint_cpm_2").is_ok());
        assert!(MetricName::new("").is_err());
        assert!(MetricName::new("a:b").is_err());
        assert!(MetricName::new("with space").is_err());
        assert!(MetricName::new("x".repeat(MAX_NAME_LENGTH)).is_ok());
        assert!(MetricName::new("x".repeat(MAX_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_metric_id() {
        let key = MetricKey::new(
            MetricName::new("service_cpm").unwrap(),
            EntityId::from("c2VydmljZQ==.1"),
            TimeBucket::parse(202402291307).unwrap(),
        );

        assert_eq!(key.id().as_str(), "service_cpm:202402291307_c2VydmljZQ==.1");
    }

    #[test]
    fn test_metric_id_distinct_buckets() {
        let name = MetricName::new("service_cpm").unwrap();
        let minute = MetricKey::new(
            name.clone(),
            EntityId::from("1"),
            TimeBucket::parse(202402291307).unwrap(),
        );
        let hour = minute.with_time_bucket(TimeBucket::parse(2024022913).unwrap());

        assert_ne!(minute.id(), hour.id());
        assert_eq!(hour.granularity(), Granularity::Hour);
    }

    #[test]
    fn test_unknown_entity() {
        assert!(EntityId::unknown().is_unknown());
        assert!(!EntityId::from("svc").is_unknown());
        assert_eq!(format!("{:?}", EntityId::unknown()), "EntityId(<unknown>)");
    }

    #[test]
    fn test_metric_name_serde() {
        let name: MetricName = serde_json::from_str(r#""service_sla""#).unwrap();
        assert_eq!(name.as_str(), "service_sla");
        assert!(serde_json::from_str::<MetricName>(r#""bad:name""#).is_err());
    }
}
