//! Low-latency tier holding one unquantized record per (series, timestamp).

use chrono::{DateTime, Utc};
use crossbeam::channel::Sender;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
    error::{AionError, Result, WriteFailure},
    store::Store,
    types::{check_attribute_name, from_unix, Entry, TIME_KEY},
};

/// One cache row as stored: the time column and every attribute column, all
/// still as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub time: String,
    pub fields: Vec<(String, String)>,
}

/// The narrow backend surface a [`CacheStore`] writes through.
pub trait CacheTable: Send + Sync {
    /// Writes one record; `fields` are (attribute, decimal text) pairs.
    fn insert_record(
        &self,
        series: Uuid,
        timestamp: i64,
        fields: &[(String, String)],
    ) -> anyhow::Result<()>;

    /// Records of `series` with `start <= time <= end`, in time order.
    fn scan_records(&self, series: Uuid, start: i64, end: i64) -> anyhow::Result<Vec<CacheRecord>>;
}

/// Decimal text for a cache column. Shortest form that parses back to the
/// same `f64`.
pub fn format_value(value: f64) -> String {
    value.to_string()
}

fn parse_field(field: &str, value: &str) -> Result<f64> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|e| AionError::FieldParse {
            field: field.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Rebuilds an entry from a record, keeping every field that parses.
///
/// Each unparseable requested field is reported on `errors`. A record whose
/// time column does not parse yields no entry.
fn reconstruct(
    record: CacheRecord,
    attributes: &[String],
    errors: &Sender<AionError>,
) -> Option<Entry> {
    let timestamp = record
        .time
        .trim()
        .parse::<i64>()
        .map_err(|e| AionError::FieldParse {
            field: TIME_KEY.to_string(),
            value: record.time.clone(),
            reason: e.to_string(),
        })
        .and_then(from_unix);
    let mut entry = match timestamp {
        Ok(timestamp) => Entry::new(timestamp),
        Err(e) => {
            warn!(error = %e, "Dropping cache record without a usable timestamp");
            let _ = errors.send(e);
            return None;
        }
    };

    for (name, text) in record.fields {
        if !attributes.is_empty() && !attributes.contains(&name) {
            continue;
        }
        match parse_field(&name, &text) {
            Ok(value) => {
                entry.attributes.insert(name, value);
            }
            Err(e) => {
                debug!(error = %e, "Skipping unparseable cache field");
                let _ = errors.send(e);
            }
        }
    }
    Some(entry)
}

/// Entry store over a [`CacheTable`]: no bucketing, no quantization.
#[derive(Debug, Clone)]
pub struct CacheStore<T: CacheTable> {
    table: T,
}

impl<T: CacheTable> CacheStore<T> {
    pub fn new(table: T) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &T {
        &self.table
    }
}

impl<T: CacheTable> Store for CacheStore<T> {
    fn insert(&self, series: Uuid, entry: &Entry) -> Result<()> {
        let mut fields = Vec::with_capacity(entry.attributes.len());
        for (name, value) in &entry.attributes {
            check_attribute_name(name)?;
            fields.push((name.clone(), format_value(*value)));
        }
        trace!(%series, timestamp = entry.unix(), fields = fields.len(), "Cache insert");
        self.table.insert_record(series, entry.unix(), &fields)?;
        Ok(())
    }

    fn put(&self, series: Uuid, entries: &[Entry]) -> Result<()> {
        let mut failures = Vec::new();
        for entry in entries {
            if let Err(error) = self.insert(series, entry) {
                warn!(%series, timestamp = entry.unix(), %error, "Cache record write failed");
                failures.push(WriteFailure {
                    key: entry.unix(),
                    error,
                });
            }
        }
        AionError::from_failures(entries.len(), failures)
    }

    /// Scans `[start, end]`; the end is inclusive for the cache tier.
    fn query(
        &self,
        series: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        attributes: &[String],
        entries: Sender<Entry>,
        errors: Sender<AionError>,
    ) {
        let records = match self
            .table
            .scan_records(series, start.timestamp(), end.timestamp())
        {
            Ok(records) => records,
            Err(e) => {
                warn!(%series, error = %e, "Cache scan failed");
                let _ = errors.send(AionError::Backend(e));
                return;
            }
        };
        debug!(%series, records = records.len(), "Cache scan");

        for record in records {
            if let Some(entry) = reconstruct(record, attributes, &errors) {
                if entries.send(entry).is_err() {
                    debug!(%series, "Entry receiver dropped, stopping cache scan");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    fn record(time: &str, fields: &[(&str, &str)]) -> CacheRecord {
        CacheRecord {
            time: time.to_string(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn format_value_round_trips() {
        for value in [0.0, 1.5, -3.25, 0.1 + 0.2, 1e-300, 12_345_678.9] {
            assert_eq!(format_value(value).parse::<f64>().unwrap(), value);
        }
    }

    #[test]
    fn bad_field_is_reported_and_the_rest_kept() {
        let (errors_tx, errors_rx) = unbounded();
        let entry = reconstruct(
            record("60", &[("raw", "1.5"), ("count", "three")]),
            &[],
            &errors_tx,
        )
        .expect("entry survives a bad field");
        drop(errors_tx);

        assert_eq!(entry.unix(), 60);
        assert_eq!(entry.get("raw"), Some(1.5));
        assert_eq!(entry.get("count"), None);
        let errors: Vec<AionError> = errors_rx.iter().collect();
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], AionError::FieldParse { field, .. } if field == "count"));
    }

    #[test]
    fn unrequested_fields_are_not_parsed() {
        let (errors_tx, errors_rx) = unbounded();
        let entry = reconstruct(
            record("0", &[("raw", "2"), ("junk", "??")]),
            &["raw".to_string()],
            &errors_tx,
        )
        .unwrap();
        drop(errors_tx);

        assert_eq!(entry.attributes.len(), 1);
        assert_eq!(errors_rx.iter().count(), 0);
    }

    #[test]
    fn unparseable_time_drops_the_record() {
        let (errors_tx, errors_rx) = unbounded();
        assert!(reconstruct(record("noon", &[("raw", "2")]), &[], &errors_tx).is_none());
        drop(errors_tx);
        assert_eq!(errors_rx.iter().count(), 1);
    }
}
