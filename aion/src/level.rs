//! A retention tier: one filter bound to one store.

use std::{sync::Arc, thread::JoinHandle};

use chrono::{DateTime, Utc};
use crossbeam::channel::{bounded, Receiver, Sender};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    error::{AionError, Result},
    filter::AggregateFilter,
    store::Store,
    types::Entry,
};

/// Default capacity of each channel of a [`QueryStream`].
pub const DEFAULT_STREAM_CAPACITY: usize = 256;

/// Couples an [`AggregateFilter`] with a [`Store`]. Knows nothing about the
/// other levels of its cascade.
#[derive(Clone)]
pub struct Level {
    filter: AggregateFilter,
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Level")
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

impl Level {
    pub fn new(filter: AggregateFilter, store: Arc<dyn Store>) -> Self {
        Self { filter, store }
    }

    pub fn filter(&self) -> &AggregateFilter {
        &self.filter
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn insert(&self, series: Uuid, entry: &Entry) -> Result<()> {
        match self.filter.apply(entry) {
            Some(entry) => self.store.insert(series, &entry),
            None => Ok(()),
        }
    }

    pub fn put(&self, series: Uuid, entries: &[Entry]) -> Result<()> {
        let routed: Vec<Entry> = entries
            .iter()
            .filter_map(|entry| self.filter.apply(entry))
            .collect();
        if routed.is_empty() {
            debug!(%series, "Nothing to write after filtering");
            return Ok(());
        }
        self.store.put(series, &routed)
    }

    /// Same contract as [`Store::query`].
    pub fn query(
        &self,
        series: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        attributes: &[String],
        entries: Sender<Entry>,
        errors: Sender<AionError>,
    ) {
        self.store
            .query(series, start, end, attributes, entries, errors)
    }

    /// Runs the query on a worker thread over two channels bounded at
    /// `capacity`. The worker blocks while the caller is not draining.
    pub fn query_stream(
        &self,
        series: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        attributes: &[String],
        capacity: usize,
    ) -> Result<QueryStream> {
        let (entries_tx, entries) = bounded(capacity);
        let (errors_tx, errors) = bounded(capacity);
        let store = Arc::clone(&self.store);
        let attributes = attributes.to_vec();
        let handle = std::thread::Builder::new()
            .name(format!("aion-query-{series}"))
            .spawn(move || store.query(series, start, end, &attributes, entries_tx, errors_tx))
            .map_err(|e| AionError::Backend(anyhow::anyhow!("failed to spawn query worker: {e}")))?;
        Ok(QueryStream {
            entries,
            errors,
            handle,
        })
    }
}

/// Both outputs of a running query. Drain both, or the worker stalls.
#[derive(Debug)]
pub struct QueryStream {
    pub entries: Receiver<Entry>,
    pub errors: Receiver<AionError>,
    handle: JoinHandle<()>,
}

impl QueryStream {
    /// Drains both channels until the worker closes them.
    pub fn collect(self) -> (Vec<Entry>, Vec<AionError>) {
        let mut entries = Vec::new();
        let mut errors = Vec::new();
        let mut entries_open = true;
        let mut errors_open = true;
        let never_entries = crossbeam::channel::never();
        let never_errors = crossbeam::channel::never();

        while entries_open || errors_open {
            let entries_rx = if entries_open { &self.entries } else { &never_entries };
            let errors_rx = if errors_open { &self.errors } else { &never_errors };
            crossbeam::select! {
                recv(entries_rx) -> msg => match msg {
                    Ok(entry) => entries.push(entry),
                    Err(_) => entries_open = false,
                },
                recv(errors_rx) -> msg => match msg {
                    Ok(err) => {
                        warn!(error = %err, "Query reported an error");
                        errors.push(err);
                    }
                    Err(_) => errors_open = false,
                },
            }
        }

        if self.handle.join().is_err() {
            error!("Query worker panicked");
            errors.push(AionError::Backend(anyhow::anyhow!("query worker panicked")));
        }
        (entries, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::from_unix;
    use parking_lot::Mutex;

    /// Keeps written entries; query replays them and reports one error per
    /// entry lacking `raw`.
    #[derive(Default)]
    struct VecStore {
        entries: Mutex<Vec<Entry>>,
    }

    impl Store for VecStore {
        fn put(&self, _series: Uuid, entries: &[Entry]) -> Result<()> {
            self.entries.lock().extend_from_slice(entries);
            Ok(())
        }

        fn query(
            &self,
            _series: Uuid,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
            _attributes: &[String],
            entries: Sender<Entry>,
            errors: Sender<AionError>,
        ) {
            let stored = self.entries.lock().clone();
            for entry in stored {
                if entry.timestamp < start || entry.timestamp >= end {
                    continue;
                }
                if entry.get("raw").is_none() {
                    let _ = errors.send(AionError::decode("raw", "missing"));
                }
                let _ = entries.send(entry);
            }
        }
    }

    #[test]
    fn put_skips_empty_entries() -> Result<()> {
        let store = Arc::new(VecStore::default());
        let level = Level::new(AggregateFilter::new(0, ["raw"]), store.clone());
        level.put(
            Uuid::nil(),
            &[Entry::at(0)?, Entry::at(1)?.with("raw", 1.0)],
        )?;
        level.insert(Uuid::nil(), &Entry::at(2)?)?;
        assert_eq!(store.entries.lock().len(), 1);
        Ok(())
    }

    #[test]
    fn stream_with_small_capacity_delivers_everything() -> Result<()> {
        let store = Arc::new(VecStore::default());
        let level = Level::new(AggregateFilter::new(0, ["raw"]), store.clone());
        let mut batch: Vec<Entry> = (0..100)
            .map(|t| Entry::at(t).unwrap().with("raw", t as f64))
            .collect();
        batch.push(Entry::at(100)?.with("avg", 1.0));
        batch.push(Entry::at(101)?.with("avg", 2.0));
        level.put(Uuid::nil(), &batch)?;

        let stream = level.query_stream(
            Uuid::nil(),
            from_unix(0)?,
            from_unix(1000)?,
            &["raw".to_string()],
            1,
        )?;
        let (entries, errors) = stream.collect();
        assert_eq!(entries.len(), 102);
        assert_eq!(errors.len(), 2);
        assert!(entries.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        Ok(())
    }
}
