//! Kind-specific raw state of metric entities.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::ParseMetricError;
use crate::record::{FlatRecord, RecordReader, decode_pairs, encode_pairs};
use crate::time::TimeBucket;

/// The ranks computed by [`MetricValue::Percentile`] on finalize.
pub const PERCENTILE_RANKS: [i64; 5] = [50, 75, 90, 95, 99];

/// Scale of [`PercentValue::value`]: `10000` represents 100%.
pub const PERCENT_SCALE: i64 = 10_000;

/// The kind of a metric, which determines its merge and finalize rules.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// A running total.
    Sum,
    /// A number of occurrences.
    Count,
    /// Calls per minute, averaged over the bucket.
    Cpm,
    /// An arithmetic mean.
    Avg,
    /// The largest observed value.
    Max,
    /// The smallest observed value.
    Min,
    /// The ratio of matching observations in basis points.
    Percent,
    /// Counts per labeled bucket.
    Histogram,
    /// Approximate percentiles over value buckets.
    Percentile,
}

impl MetricKind {
    /// All metric kinds.
    pub const ALL: [Self; 9] = [
        Self::Sum,
        Self::Count,
        Self::Cpm,
        Self::Avg,
        Self::Max,
        Self::Min,
        Self::Percent,
        Self::Histogram,
        Self::Percentile,
    ];

    /// Returns the tag used in flat records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Cpm => "cpm",
            Self::Avg => "avg",
            Self::Max => "max",
            Self::Min => "min",
            Self::Percent => "percent",
            Self::Histogram => "histogram",
            Self::Percentile => "percentile",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricKind {
    type Err = ParseMetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseMetricError::UnknownKind(s.to_owned()))
    }
}

/// Raw state of [`MetricValue::Cpm`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CpmValue {
    /// Total number of calls in the bucket.
    pub total: i64,
    /// Calls per minute, computed on finalize.
    pub value: i64,
}

/// Raw state of [`MetricValue::Avg`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AvgValue {
    /// Sum of all observed values.
    pub sum: i64,
    /// Number of observed values.
    pub count: i64,
    /// The mean, computed on finalize.
    pub value: i64,
}

/// Raw state of [`MetricValue::Percent`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PercentValue {
    /// Number of matching observations.
    pub matched: i64,
    /// Number of all observations.
    pub total: i64,
    /// Ratio in units of [`PERCENT_SCALE`], computed on finalize.
    pub value: i64,
}

/// Raw state of [`MetricValue::Histogram`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HistogramValue {
    /// Counts per bucket label.
    pub buckets: BTreeMap<String, i64>,
}

impl HistogramValue {
    /// Adds `count` to the bucket with the given label.
    ///
    /// The record delimiter `|` is not allowed in labels and replaced with `_`.
    pub fn add(&mut self, label: &str, count: i64) {
        let label = if label.contains('|') {
            label.replace('|', "_")
        } else {
            label.to_owned()
        };

        let slot = self.buckets.entry(label).or_default();
        *slot = slot.saturating_add(count);
    }
}

/// Raw state of [`MetricValue::Percentile`].
///
/// Observations are grouped into buckets of width `precision`. Percentiles are approximated by
/// the lower bound of the bucket that contains the rank.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PercentileValue {
    /// Width of the value buckets.
    pub precision: i64,
    /// Counts per value bucket, keyed by `value / precision`.
    pub buckets: BTreeMap<i64, i64>,
    /// Values at [`PERCENTILE_RANKS`], computed on finalize.
    pub ranks: [i64; 5],
}

impl PercentileValue {
    /// Creates an empty percentile with the given bucket width.
    pub fn new(precision: i64) -> Self {
        Self {
            precision: precision.max(1),
            buckets: BTreeMap::new(),
            ranks: [0; 5],
        }
    }

    /// Records a single observation.
    pub fn add(&mut self, value: i64) {
        let slot = self
            .buckets
            .entry(value.div_euclid(self.precision))
            .or_default();
        *slot = slot.saturating_add(1);
    }

    fn merge(&mut self, other: Self) -> Result<(), Self> {
        if other.buckets.is_empty() {
            return Ok(());
        }

        if self.buckets.is_empty() {
            self.precision = other.precision;
        } else if self.precision != other.precision {
            return Err(other);
        }

        for (bucket, count) in other.buckets {
            let slot = self.buckets.entry(bucket).or_default();
            *slot = slot.saturating_add(count);
        }

        Ok(())
    }

    fn finalize(&mut self) {
        let total = self
            .buckets
            .values()
            .fold(0i64, |total, count| total.saturating_add(*count));

        for (rank, slot) in PERCENTILE_RANKS.iter().zip(&mut self.ranks) {
            *slot = 0;
            if total == 0 {
                continue;
            }

            // The smallest count of observations that covers the rank.
            let target = (i128::from(total) * i128::from(*rank) + 99) / 100;
            let mut seen = 0i128;
            for (bucket, count) in &self.buckets {
                seen += i128::from(*count);
                if seen >= target {
                    *slot = bucket.saturating_mul(self.precision);
                    break;
                }
            }
        }
    }
}

/// A single raw observation as produced by the ingestion boundary.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Observation {
    /// Adds to a [`MetricKind::Sum`].
    Sum(i64),
    /// Adds to a [`MetricKind::Count`].
    Count(i64),
    /// A number of calls for a [`MetricKind::Cpm`].
    Cpm(i64),
    /// A value contributing to a [`MetricKind::Avg`].
    Avg(i64),
    /// A value contributing to a [`MetricKind::Max`].
    Max(i64),
    /// A value contributing to a [`MetricKind::Min`].
    Min(i64),
    /// Whether the observation matched, for a [`MetricKind::Percent`].
    Percent(bool),
    /// A bucket label for a [`MetricKind::Histogram`].
    Histogram(String),
    /// A value for a [`MetricKind::Percentile`] with the given bucket width.
    Percentile {
        /// Width of the value buckets.
        precision: i64,
        /// The observed value.
        value: i64,
    },
}

/// The kind-specific state of a metric entity.
///
/// Values of the same kind form a commutative monoid under [`merge`](Self::merge), with
/// [`MetricValue::empty`] as identity element. Derived fields such as `value` or `ranks` are only
/// meaningful after [`finalize`](Self::finalize).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MetricValue {
    /// See [`MetricKind::Sum`].
    Sum(i64),
    /// See [`MetricKind::Count`].
    Count(i64),
    /// See [`MetricKind::Cpm`].
    Cpm(CpmValue),
    /// See [`MetricKind::Avg`].
    Avg(AvgValue),
    /// See [`MetricKind::Max`].
    Max(i64),
    /// See [`MetricKind::Min`].
    Min(i64),
    /// See [`MetricKind::Percent`].
    Percent(PercentValue),
    /// See [`MetricKind::Histogram`].
    Histogram(HistogramValue),
    /// See [`MetricKind::Percentile`].
    Percentile(PercentileValue),
}

impl MetricValue {
    /// Returns the state of a metric with no observations.
    pub fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Sum => Self::Sum(0),
            MetricKind::Count => Self::Count(0),
            MetricKind::Cpm => Self::Cpm(CpmValue::default()),
            MetricKind::Avg => Self::Avg(AvgValue::default()),
            MetricKind::Max => Self::Max(i64::MIN),
            MetricKind::Min => Self::Min(i64::MAX),
            MetricKind::Percent => Self::Percent(PercentValue::default()),
            MetricKind::Histogram => Self::Histogram(HistogramValue::default()),
            MetricKind::Percentile => Self::Percentile(PercentileValue::new(1)),
        }
    }

    /// Creates the state of a single observation.
    pub fn from_observation(observation: Observation) -> Self {
        match observation {
            Observation::Sum(value) => Self::Sum(value),
            Observation::Count(value) => Self::Count(value),
            Observation::Cpm(total) => Self::Cpm(CpmValue { total, value: 0 }),
            Observation::Avg(value) => Self::Avg(AvgValue {
                sum: value,
                count: 1,
                value: 0,
            }),
            Observation::Max(value) => Self::Max(value),
            Observation::Min(value) => Self::Min(value),
            Observation::Percent(matched) => Self::Percent(PercentValue {
                matched: i64::from(matched),
                total: 1,
                value: 0,
            }),
            Observation::Histogram(label) => {
                let mut histogram = HistogramValue::default();
                histogram.add(&label, 1);
                Self::Histogram(histogram)
            }
            Observation::Percentile { precision, value } => {
                let mut percentile = PercentileValue::new(precision);
                percentile.add(value);
                Self::Percentile(percentile)
            }
        }
    }

    /// Returns the kind of this value.
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Sum(_) => MetricKind::Sum,
            Self::Count(_) => MetricKind::Count,
            Self::Cpm(_) => MetricKind::Cpm,
            Self::Avg(_) => MetricKind::Avg,
            Self::Max(_) => MetricKind::Max,
            Self::Min(_) => MetricKind::Min,
            Self::Percent(_) => MetricKind::Percent,
            Self::Histogram(_) => MetricKind::Histogram,
            Self::Percentile(_) => MetricKind::Percentile,
        }
    }

    /// Merges the raw state of `other` into this value.
    ///
    /// Returns `Err(other)` without modifying `self` if the kinds differ or if two percentiles
    /// have different precisions.
    pub fn merge(&mut self, other: Self) -> Result<(), Self> {
        match (self, other) {
            (Self::Sum(a), Self::Sum(b)) | (Self::Count(a), Self::Count(b)) => {
                *a = a.saturating_add(b);
            }
            (Self::Cpm(a), Self::Cpm(b)) => a.total = a.total.saturating_add(b.total),
            (Self::Avg(a), Self::Avg(b)) => {
                a.sum = a.sum.saturating_add(b.sum);
                a.count = a.count.saturating_add(b.count);
            }
            (Self::Max(a), Self::Max(b)) => *a = (*a).max(b),
            (Self::Min(a), Self::Min(b)) => *a = (*a).min(b),
            (Self::Percent(a), Self::Percent(b)) => {
                a.matched = a.matched.saturating_add(b.matched);
                a.total = a.total.saturating_add(b.total);
            }
            (Self::Histogram(a), Self::Histogram(b)) => {
                for (label, count) in b.buckets {
                    let slot = a.buckets.entry(label).or_default();
                    *slot = slot.saturating_add(count);
                }
            }
            (Self::Percentile(a), Self::Percentile(b)) => {
                return a.merge(b).map_err(Self::Percentile);
            }
            (_, other) => return Err(other),
        }

        Ok(())
    }

    /// Computes the derived fields from the raw state.
    ///
    /// Finalizing is idempotent: it only reads raw state and overwrites derived fields.
    pub fn finalize(&mut self, time_bucket: TimeBucket) {
        match self {
            Self::Cpm(cpm) => {
                let minutes = i64::try_from(time_bucket.duration_minutes())
                    .unwrap_or(i64::MAX)
                    .max(1);
                cpm.value = cpm.total / minutes;
            }
            Self::Avg(avg) => {
                avg.value = avg.sum.checked_div(avg.count).unwrap_or(0);
            }
            Self::Percent(percent) => {
                percent.value = percent
                    .matched
                    .saturating_mul(PERCENT_SCALE)
                    .checked_div(percent.total)
                    .unwrap_or(0);
            }
            Self::Percentile(percentile) => percentile.finalize(),
            Self::Sum(_) | Self::Count(_) | Self::Max(_) | Self::Min(_) | Self::Histogram(_) => {}
        }
    }

    /// Returns the exposed scalar value, if this kind has one.
    pub fn value(&self) -> Option<i64> {
        match self {
            Self::Sum(value) | Self::Count(value) | Self::Max(value) | Self::Min(value) => {
                Some(*value)
            }
            Self::Cpm(cpm) => Some(cpm.value),
            Self::Avg(avg) => Some(avg.value),
            Self::Percent(percent) => Some(percent.value),
            Self::Histogram(_) | Self::Percentile(_) => None,
        }
    }

    /// Appends the payload fields of this value to a flat record.
    pub(crate) fn write_fields(&self, record: &mut FlatRecord) {
        match self {
            Self::Sum(value) | Self::Count(value) | Self::Max(value) | Self::Min(value) => {
                record.push(*value);
            }
            Self::Cpm(cpm) => {
                record.push(cpm.total);
                record.push(cpm.value);
            }
            Self::Avg(avg) => {
                record.push(avg.sum);
                record.push(avg.count);
                record.push(avg.value);
            }
            Self::Percent(percent) => {
                record.push(percent.matched);
                record.push(percent.total);
                record.push(percent.value);
            }
            Self::Histogram(histogram) => {
                record.push(encode_pairs(
                    histogram.buckets.iter().map(|(label, count)| (label, *count)),
                ));
            }
            Self::Percentile(percentile) => {
                record.push(percentile.precision);
                record.push(encode_pairs(
                    percentile.buckets.iter().map(|(bucket, count)| (bucket, *count)),
                ));
                record.push(encode_pairs(
                    PERCENTILE_RANKS.iter().zip(percentile.ranks),
                ));
            }
        }
    }

    /// Reads the payload fields of a value of the given kind.
    pub(crate) fn read_fields(
        kind: MetricKind,
        reader: &mut RecordReader<'_>,
    ) -> Result<Self, ParseMetricError> {
        Ok(match kind {
            MetricKind::Sum => Self::Sum(reader.int("value")?),
            MetricKind::Count => Self::Count(reader.int("value")?),
            MetricKind::Max => Self::Max(reader.int("value")?),
            MetricKind::Min => Self::Min(reader.int("value")?),
            MetricKind::Cpm => Self::Cpm(CpmValue {
                total: reader.count("total")?,
                value: reader.int("value")?,
            }),
            MetricKind::Avg => Self::Avg(AvgValue {
                sum: reader.int("sum")?,
                count: reader.count("count")?,
                value: reader.int("value")?,
            }),
            MetricKind::Percent => Self::Percent(PercentValue {
                matched: reader.count("matched")?,
                total: reader.count("total")?,
                value: reader.int("value")?,
            }),
            MetricKind::Histogram => {
                let mut histogram = HistogramValue::default();
                for pair in decode_pairs(reader.text("buckets")?, "buckets") {
                    let (label, count) = pair?;
                    histogram.add(label, count);
                }
                Self::Histogram(histogram)
            }
            MetricKind::Percentile => {
                let precision = reader.int("precision")?;
                if precision < 1 {
                    return Err(ParseMetricError::InvalidField("precision"));
                }

                let mut percentile = PercentileValue::new(precision);
                for pair in decode_pairs(reader.text("buckets")?, "buckets") {
                    let (bucket, count) = pair?;
                    let bucket = bucket
                        .parse()
                        .map_err(|_| ParseMetricError::InvalidField("buckets"))?;
                    percentile.buckets.insert(bucket, count);
                }

                for pair in decode_pairs(reader.text("ranks")?, "ranks") {
                    let (rank, value) = pair?;
                    let index = PERCENTILE_RANKS
                        .iter()
                        .position(|r| r.to_string() == rank)
                        .ok_or(ParseMetricError::InvalidField("ranks"))?;
                    percentile.ranks[index] = value;
                }

                Self::Percentile(percentile)
            }
        })
    }
}

impl From<Observation> for MetricValue {
    fn from(observation: Observation) -> Self {
        Self::from_observation(observation)
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;
    use rand::seq::SliceRandom;

    use super::*;

    fn minute() -> TimeBucket {
        TimeBucket::parse(202402291307).unwrap()
    }

    fn observations(kind: MetricKind, values: &[i64]) -> Vec<MetricValue> {
        values
            .iter()
            .map(|&v| {
                MetricValue::from_observation(match kind {
                    MetricKind::Sum => Observation::Sum(v),
                    MetricKind::Count => Observation::Count(v),
                    MetricKind::Cpm => Observation::Cpm(v),
                    MetricKind::Avg => Observation::Avg(v),
                    MetricKind::Max => Observation::Max(v),
                    MetricKind::Min => Observation::Min(v),
                    MetricKind::Percent => Observation::Percent(v % 2 == 0),
                    MetricKind::Histogram => Observation::Histogram(format!("le{}", v % 5)),
                    MetricKind::Percentile => Observation::Percentile {
                        precision: 10,
                        value: v,
                    },
                })
            })
            .collect()
    }

    fn fold(kind: MetricKind, values: &[MetricValue]) -> MetricValue {
        let mut acc = MetricValue::empty(kind);
        for value in values {
            acc.merge(value.clone()).unwrap();
        }
        acc.finalize(minute());
        acc
    }

    #[test]
    fn test_merge_is_commutative_monoid() {
        let mut rng = rand::rng();

        for kind in MetricKind::ALL {
            let raw: Vec<i64> = (0..50).map(|_| rng.random_range(-1000..1000)).collect();
            let mut values = observations(kind, &raw);
            let expected = fold(kind, &values);

            values.shuffle(&mut rng);
            assert_eq!(fold(kind, &values), expected, "order matters for {kind}");

            // Associativity: merge two halves separately, then merge the results.
            let (left, right) = values.split_at(values.len() / 2);
            let mut grouped = fold(kind, left);
            grouped.merge(fold(kind, right)).unwrap();
            grouped.finalize(minute());
            assert_eq!(grouped, expected, "grouping matters for {kind}");

            // Identity element.
            let mut with_empty = expected.clone();
            with_empty.merge(MetricValue::empty(kind)).unwrap();
            with_empty.finalize(minute());
            assert_eq!(with_empty, expected, "empty is not neutral for {kind}");
        }
    }

    #[test]
    fn test_finalize_is_idempotent() {
        for kind in MetricKind::ALL {
            let mut value = fold(kind, &observations(kind, &[3, 14, 15, 92, 65]));
            let once = value.clone();
            value.finalize(minute());
            assert_eq!(value, once, "finalize changed {kind}");
        }
    }

    #[test]
    fn test_merge_kind_mismatch() {
        let mut sum = MetricValue::Sum(1);
        let other = MetricValue::Count(2);
        assert_eq!(sum.merge(other.clone()), Err(other));
        assert_eq!(sum, MetricValue::Sum(1));
    }

    #[test]
    fn test_percentile_precision_mismatch() {
        let mut a = MetricValue::from_observation(Observation::Percentile {
            precision: 10,
            value: 5,
        });
        let b = MetricValue::from_observation(Observation::Percentile {
            precision: 100,
            value: 5,
        });

        let before = a.clone();
        assert!(a.merge(b).is_err());
        assert_eq!(a, before);
    }

    #[test]
    fn test_finalize_values() {
        let mut cpm = MetricValue::Cpm(CpmValue {
            total: 600,
            value: 0,
        });
        cpm.finalize(TimeBucket::parse(2024022913).unwrap());
        assert_eq!(cpm.value(), Some(10));

        let mut avg = fold(MetricKind::Avg, &observations(MetricKind::Avg, &[2, 4, 9]));
        avg.finalize(minute());
        assert_eq!(avg.value(), Some(5));

        let mut empty_avg = MetricValue::empty(MetricKind::Avg);
        empty_avg.finalize(minute());
        assert_eq!(empty_avg.value(), Some(0));

        let mut percent = MetricValue::Percent(PercentValue {
            matched: 1,
            total: 3,
            value: 0,
        });
        percent.finalize(minute());
        assert_eq!(percent.value(), Some(3333));
    }

    #[test]
    fn test_percentile_ranks() {
        let values: Vec<i64> = (1..=100).collect();
        let MetricValue::Percentile(percentile) = fold(
            MetricKind::Percentile,
            &observations(MetricKind::Percentile, &values),
        ) else {
            panic!("expected percentile");
        };

        assert_eq!(percentile.ranks, [50, 70, 90, 90, 90]);
    }

    #[test]
    fn test_histogram_label_sanitized() {
        let mut histogram = HistogramValue::default();
        histogram.add("a|b", 2);
        histogram.add("a_b", 1);
        assert_eq!(histogram.buckets.get("a_b"), Some(&3));
    }

    #[test]
    fn test_observation_serde() {
        let observation: Observation =
            serde_json::from_str(r#"{"kind": "percent", "value": true}"#).unwrap();
        assert_eq!(observation, Observation::Percent(true));

        let observation: Observation = serde_json::from_str(
            r#"{"kind": "percentile", "value": {"precision": 10, "value": 42}}"#,
        )
        .unwrap();
        assert_eq!(
            observation,
            Observation::Percentile {
                precision: 10,
                value: 42
            }
        );
    }
}
