//! Backend-neutral bucket repository contract.
//!
//! A repository persists whole buckets under a partition key derived from
//! (series, granularity) and a range key derived from the bucket start, and
//! streams decoded entries back over a pair of channels.
use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use crossbeam::channel::Sender;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
    codec::BucketDecoder,
    error::{AionError, Result},
    iterator::BucketEntryReader,
    types::{bucket_start, partition_key, whole_seconds, EncodedBucketAttribute, Entry, TIME_ATTRIBUTE},
};

/// Everything a repository needs to scan and decode one range of buckets.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketQuery {
    pub series: Uuid,
    pub granularity: Duration,
    /// Bucket window length; used to find the bucket holding `start`.
    pub duration: Duration,
    /// Fixed-point scale the buckets were written with.
    pub multiplier: f64,
    pub start: DateTime<Utc>,
    /// Exclusive.
    pub end: DateTime<Utc>,
    pub attributes: Vec<String>,
}

impl BucketQuery {
    pub fn partition_key(&self) -> String {
        partition_key(self.series, self.granularity)
    }

    /// Range key of the bucket whose window holds `start`; the scan lower bound.
    pub fn first_bucket(&self) -> i64 {
        bucket_start(self.start.timestamp(), whole_seconds(self.duration).max(1))
    }

    /// Exclusive scan upper bound.
    pub fn end_unix(&self) -> i64 {
        self.end.timestamp()
    }

    pub fn contains(&self, unix_seconds: i64) -> bool {
        unix_seconds >= self.start.timestamp() && unix_seconds < self.end_unix()
    }
}

/// Put/Query over buckets, implemented once per backend.
pub trait Repository: Send + Sync {
    /// Writes or overwrites one bucket. Writing the same payload twice leaves
    /// the stored bucket unchanged.
    fn put(
        &self,
        series: Uuid,
        granularity: Duration,
        bucket_start: DateTime<Utc>,
        attributes: &[EncodedBucketAttribute],
    ) -> Result<()>;

    /// Streams the entries of `[query.start, query.end)` in ascending bucket
    /// order. Errors go to `errors`; a bad bucket stops emission for that
    /// bucket only. Both senders are dropped on return, which closes the
    /// channels once every matching bucket has been attempted.
    fn query(&self, query: &BucketQuery, entries: Sender<Entry>, errors: Sender<AionError>);

    /// Every stored column of one bucket, time column included. `None` when
    /// no bucket exists at `bucket_start`.
    fn get(
        &self,
        series: Uuid,
        granularity: Duration,
        bucket_start: DateTime<Utc>,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>>;
}

/// Builds the entry reader for one bucket from its raw columns.
pub(crate) fn bucket_reader(
    query: &BucketQuery,
    start: i64,
    mut columns: BTreeMap<String, Vec<u8>>,
) -> Result<BucketEntryReader> {
    let time_data = columns
        .remove(TIME_ATTRIBUTE)
        .ok_or_else(|| AionError::decode(TIME_ATTRIBUTE, "bucket has no time column"))?;
    let time = BucketDecoder::for_column(TIME_ATTRIBUTE, start, time_data)?;
    let mut decoders = Vec::with_capacity(query.attributes.len());
    for name in &query.attributes {
        match columns.remove(name) {
            Some(data) => decoders.push(BucketDecoder::for_column(name.clone(), 0, data)?),
            None => trace!(start, attribute = %name, "Attribute absent from bucket"),
        }
    }
    Ok(BucketEntryReader::new(query.multiplier, time, decoders))
}

/// Decodes every attribute column of one bucket into entries.
pub(crate) fn decode_bucket(
    multiplier: f64,
    start: i64,
    mut columns: BTreeMap<String, Vec<u8>>,
) -> Result<Vec<Entry>> {
    let time_data = columns
        .remove(TIME_ATTRIBUTE)
        .ok_or_else(|| AionError::decode(TIME_ATTRIBUTE, "bucket has no time column"))?;
    let time = BucketDecoder::for_column(TIME_ATTRIBUTE, start, time_data)?;
    let decoders = columns
        .into_iter()
        .map(|(name, data)| BucketDecoder::for_column(name, 0, data))
        .collect::<Result<Vec<_>>>()?;
    BucketEntryReader::new(multiplier, time, decoders).collect()
}

/// Decodes one bucket and sends its in-range entries. Any failure is wrapped
/// as [`AionError::Bucket`] and sent once.
///
/// Returns `false` when a receiver has gone away and the scan should stop.
pub(crate) fn emit_bucket(
    query: &BucketQuery,
    start: i64,
    columns: Result<BTreeMap<String, Vec<u8>>>,
    entries: &Sender<Entry>,
    errors: &Sender<AionError>,
) -> bool {
    let fail = |source: AionError| {
        warn!(start, error = %source, "Skipping unreadable bucket");
        errors
            .send(AionError::Bucket {
                start,
                source: Box::new(source),
            })
            .is_ok()
    };

    let reader = match columns.and_then(|columns| bucket_reader(query, start, columns)) {
        Ok(reader) => reader,
        Err(e) => return fail(e),
    };

    let mut emitted = 0usize;
    for item in reader {
        match item {
            Ok(entry) => {
                // Boundary buckets may hold samples outside the requested range.
                if !query.contains(entry.unix()) {
                    continue;
                }
                if entries.send(entry).is_err() {
                    debug!(start, "Entry receiver dropped, stopping scan");
                    return false;
                }
                emitted += 1;
            }
            Err(e) => return fail(e),
        }
    }
    trace!(start, emitted, "Bucket emitted");
    true
}
