use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AionError, Result};

/// Column holding the encoded sample offsets of a bucket.
pub const TIME_ATTRIBUTE: &str = "times";
/// Partition key column.
pub const SERIES_KEY: &str = "series";
/// Range (clustering) key column.
pub const TIME_KEY: &str = "time";

/// Names an entry attribute may not use.
pub const RESERVED_ATTRIBUTES: [&str; 3] = [TIME_ATTRIBUTE, SERIES_KEY, TIME_KEY];

// --- Basic Data Types ---

/// One observation of a series: a second-resolution timestamp and a set of
/// named scalar values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub timestamp: DateTime<Utc>,
    pub attributes: BTreeMap<String, f64>,
}

impl Entry {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            attributes: BTreeMap::new(),
        }
    }

    /// Builds an entry from unix seconds.
    pub fn at(unix_seconds: i64) -> Result<Self> {
        Ok(Self::new(from_unix(unix_seconds)?))
    }

    pub fn with<N: Into<String>>(mut self, name: N, value: f64) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.attributes.get(name).copied()
    }

    pub fn unix(&self) -> i64 {
        self.timestamp.timestamp()
    }
}

/// One attribute column of a bucket, already encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBucketAttribute {
    pub name: String,
    pub data: Vec<u8>,
}

// --- Helpers ---

pub fn from_unix(unix_seconds: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(unix_seconds, 0).ok_or(AionError::TimestampOutOfRange(unix_seconds))
}

/// Start of the bucket of length `duration_secs` containing `unix_seconds`.
///
/// Equals `t - (t mod d)` for non-negative timestamps and floors towards
/// negative infinity otherwise.
pub fn bucket_start(unix_seconds: i64, duration_secs: i64) -> i64 {
    unix_seconds - unix_seconds.rem_euclid(duration_secs)
}

/// Whole seconds of a duration as a signed key component.
pub fn whole_seconds(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

/// Partition key shared by every bucket of a (series, granularity) pair.
pub fn partition_key(series: Uuid, granularity: Duration) -> String {
    format!("{}|{}", series, whole_seconds(granularity))
}

pub fn check_attribute_name(name: &str) -> Result<()> {
    if RESERVED_ATTRIBUTES.contains(&name) {
        return Err(AionError::ReservedAttribute(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_start_aligns_to_duration() {
        assert_eq!(bucket_start(0, 600), 0);
        assert_eq!(bucket_start(599, 600), 0);
        assert_eq!(bucket_start(600, 600), 600);
        assert_eq!(bucket_start(1_609_459_261, 600), 1_609_459_200);
        for t in [1_i64, 59, 61, 1234, 86_399] {
            assert_eq!(bucket_start(t, 60), t - t % 60);
        }
    }

    #[test]
    fn bucket_start_floors_negative_timestamps() {
        assert_eq!(bucket_start(-1, 600), -600);
        assert_eq!(bucket_start(-600, 600), -600);
    }

    #[test]
    fn partition_key_joins_series_and_granularity() {
        let series = Uuid::parse_str("6ba7b810-9dad-11d1-80b4-00c04fd430c8").unwrap();
        assert_eq!(
            partition_key(series, Duration::from_secs(60)),
            "6ba7b810-9dad-11d1-80b4-00c04fd430c8|60"
        );
    }

    #[test]
    fn reserved_names_are_rejected() {
        assert!(check_attribute_name("raw").is_ok());
        for name in RESERVED_ATTRIBUTES {
            assert!(matches!(
                check_attribute_name(name),
                Err(AionError::ReservedAttribute(_))
            ));
        }
    }

    #[test]
    fn entry_builder_sets_attributes() -> Result<()> {
        let entry = Entry::at(120)?.with("raw", 3.25).with("count", 2.0);
        assert_eq!(entry.unix(), 120);
        assert_eq!(entry.get("raw"), Some(3.25));
        assert_eq!(entry.get("sum"), None);
        Ok(())
    }
}
