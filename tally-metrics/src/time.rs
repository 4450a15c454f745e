//! Calendar-aligned time buckets at the four supported granularities.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Datelike, Months, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tally_common::time::UnixTimestamp;

use crate::protocol::ParseMetricError;

/// The width of a [`TimeBucket`].
///
/// Granularities are ordered from finest to coarsest. [`Granularity::Minute`] is the base
/// granularity at which all metrics are ingested, the other granularities are produced by
/// downsampling.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One calendar minute, encoded as `YYYYMMDDhhmm`.
    Minute,
    /// One calendar hour, encoded as `YYYYMMDDhh`.
    Hour,
    /// One calendar day, encoded as `YYYYMMDD`.
    Day,
    /// One calendar month, encoded as `YYYYMM`.
    Month,
}

impl Granularity {
    /// All granularities in downsampling order.
    pub const ALL: [Self; 4] = [Self::Minute, Self::Hour, Self::Day, Self::Month];

    /// Returns the lowercase name of this granularity.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    /// Returns the next coarser granularity in the downsampling chain.
    ///
    /// Returns `None` for [`Granularity::Month`], which terminates the chain.
    pub fn next_coarser(self) -> Option<Self> {
        match self {
            Self::Minute => Some(Self::Hour),
            Self::Hour => Some(Self::Day),
            Self::Day => Some(Self::Month),
            Self::Month => None,
        }
    }

    /// Number of decimal digits of a [`TimeBucket`] at this granularity.
    const fn digits(self) -> u32 {
        match self {
            Self::Minute => 12,
            Self::Hour => 10,
            Self::Day => 8,
            Self::Month => 6,
        }
    }

    fn from_digits(digits: u32) -> Option<Self> {
        match digits {
            12 => Some(Self::Minute),
            10 => Some(Self::Hour),
            8 => Some(Self::Day),
            6 => Some(Self::Month),
            _ => None,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Granularity {
    type Err = ParseMetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|granularity| granularity.as_str() == s)
            .ok_or(ParseMetricError::UnknownGranularity)
    }
}

/// A calendar position encoded as decimal digits.
///
/// The encoding is `YYYYMMDDhhmm` for minutes, `YYYYMMDDhh` for hours, `YYYYMMDD` for days and
/// `YYYYMM` for months, always in UTC. The granularity is derived from the number of digits, and
/// buckets of the same granularity order chronologically when compared numerically.
///
/// A `TimeBucket` can only be constructed from a valid calendar position, see
/// [`TimeBucket::parse`].
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct TimeBucket(u64);

impl TimeBucket {
    /// Returns the bucket at `granularity` that contains the given timestamp.
    ///
    /// Returns `None` if the timestamp is outside of the years 1000 through 9999.
    pub fn from_timestamp(timestamp: UnixTimestamp, granularity: Granularity) -> Option<Self> {
        Self::from_datetime(&timestamp.as_datetime()?, granularity)
    }

    /// Returns the bucket at `granularity` that contains the given date.
    pub fn from_datetime(date: &DateTime<Utc>, granularity: Granularity) -> Option<Self> {
        let year = u64::try_from(date.year())
            .ok()
            .filter(|year| (1000..=9999).contains(year))?;

        let mut value = year * 100 + u64::from(date.month());
        if granularity <= Granularity::Day {
            value = value * 100 + u64::from(date.day());
        }
        if granularity <= Granularity::Hour {
            value = value * 100 + u64::from(date.hour());
        }
        if granularity == Granularity::Minute {
            value = value * 100 + u64::from(date.minute());
        }

        Some(Self(value))
    }

    /// Validates and wraps an encoded bucket.
    pub fn parse(value: u64) -> Result<Self, ParseMetricError> {
        let bucket = Self(value);
        match bucket.start_datetime() {
            Some(_) => Ok(bucket),
            None => Err(ParseMetricError::InvalidTimeBucket(value)),
        }
    }

    /// Returns the encoded value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the granularity derived from the encoding width.
    pub fn granularity(self) -> Granularity {
        Self::granularity_of(self.0).unwrap_or(Granularity::Minute)
    }

    fn granularity_of(value: u64) -> Option<Granularity> {
        Granularity::from_digits(value.checked_ilog10()? + 1)
    }

    /// Truncates this bucket to a coarser (or equal) granularity.
    ///
    /// Returns `None` if `granularity` is finer than the granularity of this bucket.
    pub fn to_granularity(self, granularity: Granularity) -> Option<Self> {
        let own = self.granularity();
        if granularity < own {
            return None;
        }

        let shift = own.digits() - granularity.digits();
        Some(Self(self.0 / 10u64.pow(shift)))
    }

    /// Returns the first instant covered by this bucket.
    pub fn start(self) -> UnixTimestamp {
        self.start_datetime()
            .and_then(UnixTimestamp::from_datetime)
            .unwrap_or(UnixTimestamp::from_secs(0))
    }

    /// Returns the first instant after this bucket, which is the start of the next bucket.
    pub fn end(self) -> UnixTimestamp {
        self.next().map_or(self.start(), Self::start)
    }

    /// Returns the bucket directly following this one at the same granularity.
    pub fn next(self) -> Option<Self> {
        let start = self.start_datetime()?;
        let next = match self.granularity() {
            Granularity::Minute => start + chrono::Duration::minutes(1),
            Granularity::Hour => start + chrono::Duration::hours(1),
            Granularity::Day => start + chrono::Duration::days(1),
            Granularity::Month => start.checked_add_months(Months::new(1))?,
        };

        Self::from_datetime(&next, self.granularity())
    }

    /// Returns the length of this bucket in minutes.
    ///
    /// Month buckets have a variable length depending on the number of days in the month.
    pub fn duration_minutes(self) -> u64 {
        (self.end() - self.start()).as_secs() / 60
    }

    /// Returns the most recent bucket at `granularity` that had fully ended at `now`.
    pub fn last_completed(now: UnixTimestamp, granularity: Granularity) -> Option<Self> {
        let current = Self::from_timestamp(now, granularity)?;
        Self::from_timestamp(current.start() - Duration::from_secs(1), granularity)
    }

    fn start_datetime(self) -> Option<DateTime<Utc>> {
        let granularity = Self::granularity_of(self.0)?;

        let mut rest = self.0;
        let mut take = || {
            let part = rest % 100;
            rest /= 100;
            part as u32
        };

        let minute = if granularity == Granularity::Minute { take() } else { 0 };
        let hour = if granularity <= Granularity::Hour { take() } else { 0 };
        let day = if granularity <= Granularity::Day { take() } else { 1 };
        let month = take();
        let year = i32::try_from(rest).ok()?;

        Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
            .single()
    }
}

impl fmt::Debug for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimeBucket({})", self.0)
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<u64> for TimeBucket {
    type Error = ParseMetricError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TimeBucket> for u64 {
    fn from(bucket: TimeBucket) -> Self {
        bucket.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> UnixTimestamp {
        let date = Utc
            .with_ymd_and_hms(year, month, day, hour, minute, 30)
            .unwrap();
        UnixTimestamp::from_datetime(date).unwrap()
    }

    #[test]
    fn test_encoding() {
        let timestamp = ts(2024, 2, 29, 13, 7);

        let expected = [
            (Granularity::Minute, 202402291307),
            (Granularity::Hour, 2024022913),
            (Granularity::Day, 20240229),
            (Granularity::Month, 202402),
        ];

        for (granularity, value) in expected {
            let bucket = TimeBucket::from_timestamp(timestamp, granularity).unwrap();
            assert_eq!(bucket.as_u64(), value);
            assert_eq!(bucket.granularity(), granularity);
        }
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(TimeBucket::parse(202402301307).is_err()); // Feb 30th
        assert!(TimeBucket::parse(202413).is_err());
        assert!(TimeBucket::parse(2024022925).is_err());
        assert!(TimeBucket::parse(2024022).is_err()); // 7 digits
        assert!(TimeBucket::parse(0).is_err());
        assert_eq!(
            TimeBucket::parse(20240229).unwrap().granularity(),
            Granularity::Day
        );
    }

    #[test]
    fn test_to_granularity() {
        let minute = TimeBucket::parse(202402291307).unwrap();
        assert_eq!(
            minute.to_granularity(Granularity::Hour).unwrap().as_u64(),
            2024022913
        );
        assert_eq!(
            minute.to_granularity(Granularity::Month).unwrap().as_u64(),
            202402
        );

        let day = TimeBucket::parse(20240229).unwrap();
        assert_eq!(day.to_granularity(Granularity::Hour), None);
        assert_eq!(day.to_granularity(Granularity::Day), Some(day));
    }

    #[test]
    fn test_duration_minutes() {
        let check = |value, minutes| {
            assert_eq!(TimeBucket::parse(value).unwrap().duration_minutes(), minutes);
        };

        check(202402291307, 1);
        check(2024022913, 60);
        check(20240229, 1440);
        check(202402, 29 * 1440);
        check(202312, 31 * 1440);
    }

    #[test]
    fn test_next_rolls_over() {
        let minute = TimeBucket::parse(202312312359).unwrap();
        assert_eq!(minute.next().unwrap().as_u64(), 202401010000);

        let month = TimeBucket::parse(202312).unwrap();
        assert_eq!(month.next().unwrap().as_u64(), 202401);
        assert_eq!(month.end(), month.next().unwrap().start());
    }

    #[test]
    fn test_last_completed() {
        let now = ts(2024, 3, 1, 0, 0);
        let last = |granularity| {
            TimeBucket::last_completed(now, granularity)
                .unwrap()
                .as_u64()
        };

        assert_eq!(last(Granularity::Minute), 202402292359);
        assert_eq!(last(Granularity::Hour), 2024022923);
        assert_eq!(last(Granularity::Day), 20240229);
        assert_eq!(last(Granularity::Month), 202402);
    }

    #[test]
    fn test_serde() {
        let bucket: TimeBucket = serde_json::from_str("2024022913").unwrap();
        assert_eq!(bucket.granularity(), Granularity::Hour);
        assert_eq!(serde_json::to_string(&bucket).unwrap(), "2024022913");
        assert!(serde_json::from_str::<TimeBucket>("2024022999").is_err());
    }

    #[test]
    fn test_granularity_order() {
        assert!(Granularity::Minute < Granularity::Hour);
        assert_eq!(Granularity::Day.next_coarser(), Some(Granularity::Month));
        assert_eq!(Granularity::Month.next_coarser(), None);
        assert_eq!("hour".parse::<Granularity>().unwrap(), Granularity::Hour);
    }
}
