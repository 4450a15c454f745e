//! Flat, ordered field lists shared by the remote transport and storage mapping.
//!
//! A [`FlatRecord`] of a metric always starts with the same four fields, followed by the
//! kind-specific payload:
//!
//! | position | field       | type   |
//! |----------|-------------|--------|
//! | 0        | kind        | text   |
//! | 1        | name        | text   |
//! | 2        | entity id   | text   |
//! | 3        | time bucket | int    |
//! | 4..      | payload     | varies |
//!
//! Nested payloads such as histogram buckets are flattened into a single text field of the form
//! `key:value|key:value`.

use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::protocol::ParseMetricError;

/// Separates pairs in a delimited text field.
const PAIR_SEPARATOR: &str = "|";

/// Separates key and value of a pair in a delimited text field.
const KEY_VALUE_SEPARATOR: &str = ":";

/// A single field of a [`FlatRecord`].
#[derive(Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Field {
    /// An integer field.
    Int(i64),
    /// A text field.
    Text(String),
}

impl From<i64> for Field {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<String> for Field {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

/// An ordered list of primitive fields.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct FlatRecord(Vec<Field>);

impl FlatRecord {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field.
    pub fn push(&mut self, field: impl Into<Field>) {
        self.0.push(field.into());
    }

    /// Returns all fields in order.
    pub fn fields(&self) -> &[Field] {
        &self.0
    }

    /// Returns the number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a cursor that reads fields in order.
    pub fn reader(&self) -> RecordReader<'_> {
        RecordReader {
            fields: self.0.iter(),
        }
    }
}

impl From<Vec<Field>> for FlatRecord {
    fn from(fields: Vec<Field>) -> Self {
        Self(fields)
    }
}

/// Reads the fields of a [`FlatRecord`] front to back.
#[derive(Debug)]
pub struct RecordReader<'a> {
    fields: std::slice::Iter<'a, Field>,
}

impl<'a> RecordReader<'a> {
    /// Reads the next field as integer.
    pub fn int(&mut self, name: &'static str) -> Result<i64, ParseMetricError> {
        match self.fields.next() {
            Some(Field::Int(value)) => Ok(*value),
            Some(Field::Text(_)) => Err(ParseMetricError::InvalidField(name)),
            None => Err(ParseMetricError::MissingField(name)),
        }
    }

    /// Reads the next field as a non-negative integer.
    pub fn count(&mut self, name: &'static str) -> Result<i64, ParseMetricError> {
        match self.int(name)? {
            value if value < 0 => Err(ParseMetricError::InvalidField(name)),
            value => Ok(value),
        }
    }

    /// Reads the next field as text.
    pub fn text(&mut self, name: &'static str) -> Result<&'a str, ParseMetricError> {
        match self.fields.next() {
            Some(Field::Text(value)) => Ok(value),
            Some(Field::Int(_)) => Err(ParseMetricError::InvalidField(name)),
            None => Err(ParseMetricError::MissingField(name)),
        }
    }

    /// Ensures that all fields have been consumed.
    pub fn finish(mut self) -> Result<(), ParseMetricError> {
        match self.fields.next() {
            Some(_) => Err(ParseMetricError::TrailingFields),
            None => Ok(()),
        }
    }
}

/// Joins pairs into a delimited text field.
pub(crate) fn encode_pairs<K: fmt::Display>(pairs: impl IntoIterator<Item = (K, i64)>) -> String {
    pairs
        .into_iter()
        .map(|(key, value)| format!("{key}{KEY_VALUE_SEPARATOR}{value}"))
        .join(PAIR_SEPARATOR)
}

/// Splits a delimited text field into pairs.
///
/// The key is everything before the last `:`, so keys may contain the separator themselves.
pub(crate) fn decode_pairs<'a>(
    text: &'a str,
    name: &'static str,
) -> impl Iterator<Item = Result<(&'a str, i64), ParseMetricError>> + 'a {
    text.split(PAIR_SEPARATOR)
        .filter(|pair| !pair.is_empty())
        .map(move |pair| {
            let (key, value) = pair
                .rsplit_once(KEY_VALUE_SEPARATOR)
                .ok_or(ParseMetricError::InvalidField(name))?;
            let value = value
                .parse()
                .map_err(|_| ParseMetricError::InvalidField(name))?;
            Ok((key, value))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader() {
        let record = FlatRecord::from(vec![Field::from("sum"), Field::from(42)]);
        let mut reader = record.reader();

        assert_eq!(reader.text("kind"), Ok("sum"));
        assert_eq!(reader.text("value"), Err(ParseMetricError::InvalidField("value")));
        assert_eq!(reader.int("extra"), Err(ParseMetricError::MissingField("extra")));
        assert_eq!(reader.finish(), Ok(()));
    }

    #[test]
    fn test_trailing_fields() {
        let record = FlatRecord::from(vec![Field::from(1), Field::from(2)]);
        let mut reader = record.reader();
        reader.int("first").unwrap();
        assert_eq!(reader.finish(), Err(ParseMetricError::TrailingFields));
    }

    #[test]
    fn test_pairs() {
        let encoded = encode_pairs([("le:100", 3), ("inf", 1)]);
        assert_eq!(encoded, "le:100:3|inf:1");

        let decoded: Vec<_> = decode_pairs(&encoded, "buckets")
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(decoded, vec![("le:100", 3), ("inf", 1)]);

        assert_eq!(decode_pairs("", "buckets").count(), 0);
        assert!(decode_pairs("broken", "buckets").any(|pair| pair.is_err()));
    }

    #[test]
    fn test_json_shape() {
        let record = FlatRecord::from(vec![Field::from("cpm"), Field::from(7)]);
        assert_eq!(serde_json::to_string(&record).unwrap(), r#"["cpm",7]"#);

        let parsed: FlatRecord = serde_json::from_str(r#"["cpm",7]"#).unwrap();
        assert_eq!(parsed, record);
    }
}
