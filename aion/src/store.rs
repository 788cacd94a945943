//! Entry-level store trait and the bucketed store built on a [`Repository`].

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use crossbeam::channel::Sender;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    codec::{encode_time_column, encode_value_column},
    error::{AionError, Result, WriteFailure},
    repository::{decode_bucket, BucketQuery, Repository},
    types::{
        bucket_start, check_attribute_name, from_unix, whole_seconds, EncodedBucketAttribute,
        Entry, TIME_ATTRIBUTE,
    },
};

/// What a [`Level`](crate::level::Level) needs from its storage tier.
pub trait Store: Send + Sync {
    /// Writes a batch of entries. Units of the batch (buckets, records) are
    /// written independently; failed units come back together as
    /// [`AionError::PartialWrite`].
    fn put(&self, series: Uuid, entries: &[Entry]) -> Result<()>;

    fn insert(&self, series: Uuid, entry: &Entry) -> Result<()> {
        self.put(series, std::slice::from_ref(entry))
    }

    /// Streams stored entries of `series` between `start` and `end` onto
    /// `entries`, reporting failures on `errors`. Returns once both senders
    /// have been dropped.
    fn query(
        &self,
        series: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        attributes: &[String],
        entries: Sender<Entry>,
        errors: Sender<AionError>,
    );
}

// Any shared store is a store.
impl<S: Store + ?Sized> Store for Arc<S> {
    fn put(&self, series: Uuid, entries: &[Entry]) -> Result<()> {
        (**self).put(series, entries)
    }

    fn insert(&self, series: Uuid, entry: &Entry) -> Result<()> {
        (**self).insert(series, entry)
    }

    fn query(
        &self,
        series: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        attributes: &[String],
        entries: Sender<Entry>,
        errors: Sender<AionError>,
    ) {
        (**self).query(series, start, end, attributes, entries, errors)
    }
}

/// Packs entries into fixed-duration, fixed-point buckets.
///
/// Each bucket write replaces the stored bucket, so a batch should carry the
/// whole window for every bucket it touches.
#[derive(Clone)]
pub struct BucketStore {
    granularity: Duration,
    duration: Duration,
    multiplier: f64,
    repository: Arc<dyn Repository>,
}

impl std::fmt::Debug for BucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketStore")
            .field("granularity", &self.granularity)
            .field("duration", &self.duration)
            .field("multiplier", &self.multiplier)
            .finish_non_exhaustive()
    }
}

impl BucketStore {
    /// Creates a bucket store.
    ///
    /// # Arguments
    ///
    /// * `granularity` - Nominal sampling interval; part of the partition key.
    /// * `duration` - Bucket window; a positive multiple of `granularity`.
    /// * `multiplier` - Fixed-point scale. Must never change for a tier that
    ///   already holds data.
    /// * `repository` - Backend adapter the buckets are written through.
    pub fn new(
        granularity: Duration,
        duration: Duration,
        multiplier: f64,
        repository: Arc<dyn Repository>,
    ) -> Result<Self> {
        if granularity.subsec_nanos() != 0 || duration.subsec_nanos() != 0 {
            return Err(AionError::InvalidConfig(
                "granularity and bucket duration must be whole seconds".to_string(),
            ));
        }
        if granularity.is_zero() {
            return Err(AionError::InvalidConfig(
                "granularity must be at least one second".to_string(),
            ));
        }
        if duration.is_zero() || duration.as_secs() % granularity.as_secs() != 0 {
            return Err(AionError::InvalidConfig(format!(
                "bucket duration {}s is not a positive multiple of granularity {}s",
                duration.as_secs(),
                granularity.as_secs()
            )));
        }
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(AionError::InvalidConfig(format!(
                "multiplier must be positive and finite, got {multiplier}"
            )));
        }
        info!(
            granularity_secs = granularity.as_secs(),
            duration_secs = duration.as_secs(),
            multiplier,
            "Created BucketStore"
        );
        Ok(Self {
            granularity,
            duration,
            multiplier,
            repository,
        })
    }

    pub fn granularity(&self) -> Duration {
        self.granularity
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    // NaN, infinities and values past the i64 range would quantize silently
    // to 0 or a saturated bound.
    fn check_quantizable(&self, attribute: &str, timestamp: i64, value: f64) -> Result<()> {
        let scaled = (value * self.multiplier).round();
        if scaled.is_finite() && scaled.abs() < i64::MAX as f64 {
            Ok(())
        } else {
            Err(AionError::UnrepresentableValue {
                attribute: attribute.to_string(),
                timestamp,
                value,
            })
        }
    }

    /// Encodes one bucket's entries (sorted, one per timestamp) into columns.
    fn encode_bucket(
        &self,
        start: i64,
        group: &BTreeMap<i64, &Entry>,
    ) -> Result<Vec<EncodedBucketAttribute>> {
        let timestamps: Vec<i64> = group.keys().copied().collect();
        let mut columns = vec![EncodedBucketAttribute {
            name: TIME_ATTRIBUTE.to_string(),
            data: encode_time_column(start, &timestamps),
        }];

        let names: BTreeSet<&String> = group
            .values()
            .flat_map(|entry| entry.attributes.keys())
            .collect();
        for name in names {
            let mut values = Vec::with_capacity(group.len());
            let mut ended = false;
            for (timestamp, entry) in group {
                match entry.attributes.get(name) {
                    Some(_) if ended => {
                        return Err(AionError::SparseAttribute {
                            attribute: name.clone(),
                            start,
                        })
                    }
                    Some(value) => {
                        self.check_quantizable(name, *timestamp, *value)?;
                        values.push(*value);
                    }
                    None => ended = true,
                }
            }
            columns.push(EncodedBucketAttribute {
                name: name.clone(),
                data: encode_value_column(&values, self.multiplier),
            });
        }
        Ok(columns)
    }
}

impl Store for BucketStore {
    /// Adds one sample to its bucket, keeping the samples already stored
    /// there. Attributes of an existing sample at the same timestamp are
    /// updated in place.
    fn insert(&self, series: Uuid, entry: &Entry) -> Result<()> {
        for name in entry.attributes.keys() {
            check_attribute_name(name)?;
        }
        let unix = entry.unix();
        let start = bucket_start(unix, whole_seconds(self.duration));
        let bucket_time = from_unix(start)?;

        let mut merged: BTreeMap<i64, Entry> =
            match self.repository.get(series, self.granularity, bucket_time)? {
                Some(columns) => decode_bucket(self.multiplier, start, columns)?
                    .into_iter()
                    .map(|stored| (stored.unix(), stored))
                    .collect(),
                None => BTreeMap::new(),
            };
        merged
            .entry(unix)
            .or_insert_with(|| Entry::new(entry.timestamp))
            .attributes
            .extend(entry.attributes.iter().map(|(k, v)| (k.clone(), *v)));

        let group: BTreeMap<i64, &Entry> = merged.iter().map(|(t, e)| (*t, e)).collect();
        let columns = self.encode_bucket(start, &group)?;
        self.repository
            .put(series, self.granularity, bucket_time, &columns)?;
        debug!(%series, start, samples = group.len(), "Merged sample into bucket");
        Ok(())
    }

    fn put(&self, series: Uuid, entries: &[Entry]) -> Result<()> {
        for entry in entries {
            for name in entry.attributes.keys() {
                check_attribute_name(name)?;
            }
        }

        // Later entries win on duplicate timestamps.
        let duration = whole_seconds(self.duration);
        let mut buckets: BTreeMap<i64, BTreeMap<i64, &Entry>> = BTreeMap::new();
        for entry in entries {
            let unix = entry.unix();
            buckets
                .entry(bucket_start(unix, duration))
                .or_default()
                .insert(unix, entry);
        }

        let attempted = buckets.len();
        let mut failures = Vec::new();
        for (start, group) in &buckets {
            let result = self.encode_bucket(*start, group).and_then(|columns| {
                let bucket_time = from_unix(*start)?;
                self.repository
                    .put(series, self.granularity, bucket_time, &columns)
            });
            match result {
                Ok(()) => debug!(%series, start, samples = group.len(), "Wrote bucket"),
                Err(error) => {
                    warn!(%series, start, %error, "Bucket write failed");
                    failures.push(WriteFailure { key: *start, error });
                }
            }
        }
        AionError::from_failures(attempted, failures)
    }

    fn query(
        &self,
        series: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        attributes: &[String],
        entries: Sender<Entry>,
        errors: Sender<AionError>,
    ) {
        let query = BucketQuery {
            series,
            granularity: self.granularity,
            duration: self.duration,
            multiplier: self.multiplier,
            start,
            end,
            attributes: attributes.to_vec(),
        };
        debug!(%series, %start, %end, ?attributes, "Bucket store query");
        self.repository.query(&query, entries, errors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records puts; fails the bucket starting at `fail_at`.
    #[derive(Default)]
    struct RecordingRepository {
        puts: Mutex<Vec<(i64, Vec<EncodedBucketAttribute>)>>,
        fail_at: Option<i64>,
    }

    impl Repository for RecordingRepository {
        fn put(
            &self,
            _series: Uuid,
            _granularity: Duration,
            bucket_start: DateTime<Utc>,
            attributes: &[EncodedBucketAttribute],
        ) -> Result<()> {
            if Some(bucket_start.timestamp()) == self.fail_at {
                return Err(anyhow::anyhow!("injected put failure").into());
            }
            self.puts
                .lock()
                .push((bucket_start.timestamp(), attributes.to_vec()));
            Ok(())
        }

        fn query(&self, _query: &BucketQuery, _entries: Sender<Entry>, _errors: Sender<AionError>) {}

        fn get(
            &self,
            _series: Uuid,
            _granularity: Duration,
            bucket_start: DateTime<Utc>,
        ) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
            Ok(self
                .puts
                .lock()
                .iter()
                .rev()
                .find(|(start, _)| *start == bucket_start.timestamp())
                .map(|(_, columns)| {
                    columns
                        .iter()
                        .map(|c| (c.name.clone(), c.data.clone()))
                        .collect()
                }))
        }
    }

    fn store(repository: Arc<RecordingRepository>) -> BucketStore {
        BucketStore::new(
            Duration::from_secs(60),
            Duration::from_secs(600),
            10.0,
            repository,
        )
        .unwrap()
    }

    #[test]
    fn rejects_bad_configuration() {
        let repo: Arc<dyn Repository> = Arc::new(RecordingRepository::default());
        let secs = Duration::from_secs;
        assert!(BucketStore::new(secs(60), secs(90), 10.0, repo.clone()).is_err());
        assert!(BucketStore::new(secs(0), secs(600), 10.0, repo.clone()).is_err());
        assert!(BucketStore::new(secs(60), secs(600), 0.0, repo.clone()).is_err());
        assert!(BucketStore::new(secs(60), secs(600), f64::NAN, repo.clone()).is_err());
        assert!(BucketStore::new(Duration::from_millis(1500), secs(600), 10.0, repo).is_err());
    }

    #[test]
    fn groups_entries_into_one_put_per_bucket() -> Result<()> {
        let repo = Arc::new(RecordingRepository::default());
        let entries = vec![
            Entry::at(0)?.with("raw", 1.0),
            Entry::at(1200)?.with("raw", 3.0),
            Entry::at(60)?.with("raw", 2.0),
        ];
        store(repo.clone()).put(Uuid::nil(), &entries)?;

        let puts = repo.puts.lock();
        let starts: Vec<i64> = puts.iter().map(|(start, _)| *start).collect();
        assert_eq!(starts, vec![0, 1200]);
        let names: Vec<&str> = puts[0].1.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec![TIME_ATTRIBUTE, "raw"]);
        Ok(())
    }

    #[test]
    fn failed_bucket_does_not_block_others() -> Result<()> {
        let repo = Arc::new(RecordingRepository {
            fail_at: Some(600),
            ..Default::default()
        });
        let entries = vec![
            Entry::at(0)?.with("raw", 1.0),
            Entry::at(600)?.with("raw", 2.0),
            Entry::at(1200)?.with("raw", 3.0),
        ];
        match store(repo.clone()).put(Uuid::nil(), &entries) {
            Err(AionError::PartialWrite {
                attempted,
                failures,
            }) => {
                assert_eq!(attempted, 3);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].key, 600);
            }
            other => panic!("expected partial write, got {other:?}"),
        }
        assert_eq!(repo.puts.lock().len(), 2);
        Ok(())
    }

    #[test]
    fn interior_gap_fails_only_its_bucket() -> Result<()> {
        let repo = Arc::new(RecordingRepository::default());
        let entries = vec![
            Entry::at(0)?.with("raw", 1.0),
            Entry::at(60)?,
            Entry::at(120)?.with("raw", 3.0),
            Entry::at(600)?.with("raw", 4.0),
        ];
        let err = store(repo.clone()).put(Uuid::nil(), &entries).unwrap_err();
        match err {
            AionError::PartialWrite { failures, .. } => assert!(matches!(
                failures[0].error,
                AionError::SparseAttribute { start: 0, .. }
            )),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(repo.puts.lock().len(), 1);
        Ok(())
    }

    #[test]
    fn reserved_attribute_rejects_the_batch() -> Result<()> {
        let repo = Arc::new(RecordingRepository::default());
        let entries = vec![Entry::at(0)?.with(TIME_ATTRIBUTE, 1.0)];
        assert!(matches!(
            store(repo.clone()).put(Uuid::nil(), &entries),
            Err(AionError::ReservedAttribute(_))
        ));
        assert!(repo.puts.lock().is_empty());
        Ok(())
    }

    #[test]
    fn insert_keeps_samples_already_in_the_bucket() -> Result<()> {
        let repo = Arc::new(RecordingRepository::default());
        let store = store(repo.clone());
        store.insert(Uuid::nil(), &Entry::at(60)?.with("raw", 2.5))?;
        store.insert(Uuid::nil(), &Entry::at(0)?.with("raw", 1.0))?;
        store.insert(Uuid::nil(), &Entry::at(120)?.with("raw", 3.25))?;
        store.insert(Uuid::nil(), &Entry::at(0)?.with("count", 4.0))?;

        let columns = repo
            .get(Uuid::nil(), Duration::from_secs(60), from_unix(0)?)?
            .unwrap();
        let entries = decode_bucket(10.0, 0, columns)?;
        let times: Vec<i64> = entries.iter().map(Entry::unix).collect();
        assert_eq!(times, vec![0, 60, 120]);
        assert_eq!(entries[0].get("raw"), Some(1.0));
        assert_eq!(entries[0].get("count"), Some(4.0));
        assert_eq!(entries[1].get("count"), None);
        assert!((entries[2].get("raw").unwrap() - 3.3).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn unquantizable_values_fail_their_bucket() -> Result<()> {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 1e300] {
            let repo = Arc::new(RecordingRepository::default());
            let entries = vec![
                Entry::at(0)?.with("raw", 1.0),
                Entry::at(60)?.with("raw", bad),
                Entry::at(600)?.with("raw", 2.0),
            ];
            match store(repo.clone()).put(Uuid::nil(), &entries) {
                Err(AionError::PartialWrite { failures, .. }) => {
                    assert_eq!(failures.len(), 1);
                    assert!(matches!(
                        failures[0].error,
                        AionError::UnrepresentableValue { timestamp: 60, .. }
                    ));
                }
                other => panic!("expected partial write for {bad}, got {other:?}"),
            }
            let starts: Vec<i64> = repo.puts.lock().iter().map(|(start, _)| *start).collect();
            assert_eq!(starts, vec![600]);
        }
        Ok(())
    }
}
