//! Column-family backend addressed with CQL statements.
//!
//! Partition column [`SERIES_KEY`] (text), clustering column [`TIME_KEY`]
//! (bigint), one blob column per encoded attribute plus the time column.
//! Statements are built as values and rendered to CQL text for logging; the
//! [`Session`] executes them.

use std::{collections::BTreeMap, ops::Bound, path::Path, sync::Arc, time::Duration};

use anyhow::bail;
use chrono::{DateTime, Utc};
use crossbeam::channel::Sender;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    cache::{CacheRecord, CacheTable},
    error::{AionError, Result},
    repository::{emit_bucket, BucketQuery, Repository},
    types::{partition_key, EncodedBucketAttribute, Entry, SERIES_KEY, TIME_ATTRIBUTE, TIME_KEY},
};

pub const DEFAULT_BUCKET_FAMILY: &str = "buckets";
pub const DEFAULT_CACHE_FAMILY: &str = "cache";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CqlValue {
    Text(String),
    BigInt(i64),
    Blob(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl CqlValue {
    /// Text form used by the cache: numbers in decimal, blobs lossily.
    fn to_text(&self) -> String {
        match self {
            CqlValue::Text(s) => s.clone(),
            CqlValue::BigInt(n) => n.to_string(),
            CqlValue::Blob(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }
}

pub type Row = BTreeMap<String, CqlValue>;

/// `INSERT INTO <family> (...) VALUES (...)`. Must carry the key columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub column_family: String,
    pub values: Row,
}

impl Insert {
    pub fn to_cql(&self) -> String {
        let columns: Vec<&str> = self.values.keys().map(String::as_str).collect();
        let markers = vec!["?"; columns.len()].join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.column_family,
            columns.join(", "),
            markers
        )
    }
}

/// `DELETE FROM <family>` of one whole row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delete {
    pub column_family: String,
    pub partition: String,
    pub clustering: i64,
}

impl Delete {
    pub fn to_cql(&self) -> String {
        format!(
            "DELETE FROM {} WHERE {SERIES_KEY} = ? AND {TIME_KEY} = ?",
            self.column_family
        )
    }
}

/// A single-partition clustering range select.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub column_family: String,
    /// Empty selects every column.
    pub columns: Vec<String>,
    pub partition: String,
    pub lower: Bound<i64>,
    pub upper: Bound<i64>,
}

impl Select {
    pub fn to_cql(&self) -> String {
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(", ")
        };
        let mut cql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            columns, self.column_family, SERIES_KEY
        );
        match self.lower {
            Bound::Included(_) => cql.push_str(&format!(" AND {TIME_KEY} >= ?")),
            Bound::Excluded(_) => cql.push_str(&format!(" AND {TIME_KEY} > ?")),
            Bound::Unbounded => {}
        }
        match self.upper {
            Bound::Included(_) => cql.push_str(&format!(" AND {TIME_KEY} <= ?")),
            Bound::Excluded(_) => cql.push_str(&format!(" AND {TIME_KEY} < ?")),
            Bound::Unbounded => {}
        }
        cql
    }
}

/// Executes statements against a keyspace.
pub trait Session: Send + Sync {
    fn insert(&self, statement: &Insert) -> anyhow::Result<()>;

    /// Removes the row; deleting a missing row is not an error.
    fn delete(&self, statement: &Delete) -> anyhow::Result<()>;

    /// Rows of the partition within the clustering bounds, ascending.
    fn select(&self, statement: &Select) -> anyhow::Result<Vec<Row>>;
}

// --- In-memory session ---

type Families = BTreeMap<String, BTreeMap<String, BTreeMap<i64, Row>>>;

/// Keyspace held in memory. Inserts are upserts: columns of an existing row
/// that the insert does not name keep their values.
#[derive(Debug, Default)]
pub struct MemorySession {
    families: RwLock<Families>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            AionError::Persistence(format!("Failed to open keyspace snapshot {:?}: {}", path, e))
        })?;
        let families: Families = serde_json::from_reader(file).map_err(|e| {
            AionError::Persistence(format!(
                "Failed to deserialize keyspace snapshot {:?}: {}",
                path, e
            ))
        })?;
        info!(path = ?path, families = families.len(), "Loaded keyspace snapshot");
        Ok(Self {
            families: RwLock::new(families),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let families = self.families.read();
        let file = std::fs::File::create(path).map_err(|e| {
            AionError::Persistence(format!(
                "Failed to create keyspace snapshot {:?}: {}",
                path, e
            ))
        })?;
        serde_json::to_writer_pretty(file, &*families).map_err(|e| {
            AionError::Persistence(format!(
                "Failed to serialize keyspace snapshot to {:?}: {}",
                path, e
            ))
        })?;
        debug!(path = ?path, families = families.len(), "Saved keyspace snapshot");
        Ok(())
    }

    /// Provisions an empty column family. Existing rows are kept.
    pub fn create_column_family(&self, column_family: &str) {
        self.families
            .write()
            .entry(column_family.to_string())
            .or_default();
    }

    pub fn has_column_family(&self, column_family: &str) -> bool {
        self.families.read().contains_key(column_family)
    }

    pub fn row(&self, column_family: &str, partition: &str, clustering: i64) -> Option<Row> {
        self.families
            .read()
            .get(column_family)
            .and_then(|partitions| partitions.get(partition))
            .and_then(|rows| rows.get(&clustering))
            .cloned()
    }

    /// Clustering keys of one partition, ascending.
    pub fn clustering_keys(&self, column_family: &str, partition: &str) -> Vec<i64> {
        self.families
            .read()
            .get(column_family)
            .and_then(|partitions| partitions.get(partition))
            .map(|rows| rows.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl Session for MemorySession {
    fn insert(&self, statement: &Insert) -> anyhow::Result<()> {
        let partition = match statement.values.get(SERIES_KEY) {
            Some(CqlValue::Text(p)) => p.clone(),
            _ => bail!("insert into {} lacks text column '{SERIES_KEY}'", statement.column_family),
        };
        let clustering = match statement.values.get(TIME_KEY) {
            Some(CqlValue::BigInt(t)) => *t,
            _ => bail!("insert into {} lacks bigint column '{TIME_KEY}'", statement.column_family),
        };
        trace!(cql = %statement.to_cql(), %partition, clustering, "Execute");
        let mut families = self.families.write();
        let row = families
            .entry(statement.column_family.clone())
            .or_default()
            .entry(partition)
            .or_default()
            .entry(clustering)
            .or_default();
        row.extend(statement.values.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn delete(&self, statement: &Delete) -> anyhow::Result<()> {
        trace!(cql = %statement.to_cql(), partition = %statement.partition, "Execute");
        let mut families = self.families.write();
        if let Some(rows) = families
            .get_mut(&statement.column_family)
            .and_then(|partitions| partitions.get_mut(&statement.partition))
        {
            rows.remove(&statement.clustering);
        }
        Ok(())
    }

    fn select(&self, statement: &Select) -> anyhow::Result<Vec<Row>> {
        trace!(cql = %statement.to_cql(), partition = %statement.partition, "Execute");
        if let (Bound::Included(lo) | Bound::Excluded(lo), Bound::Included(hi) | Bound::Excluded(hi)) =
            (statement.lower, statement.upper)
        {
            if lo > hi {
                return Ok(Vec::new());
            }
        }
        let families = self.families.read();
        // A family nobody has written to reads as empty.
        let Some(rows) = families
            .get(&statement.column_family)
            .and_then(|partitions| partitions.get(&statement.partition))
        else {
            return Ok(Vec::new());
        };
        Ok(rows
            .range((statement.lower, statement.upper))
            .map(|(_, row)| {
                if statement.columns.is_empty() {
                    row.clone()
                } else {
                    row.iter()
                        .filter(|(name, _)| statement.columns.contains(name))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect()
                }
            })
            .collect())
    }
}

// --- Repository ---

/// Bucket repository over a [`Session`].
#[derive(Clone)]
pub struct CqlRepository {
    session: Arc<dyn Session>,
    column_family: String,
}

impl CqlRepository {
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self::with_column_family(session, DEFAULT_BUCKET_FAMILY)
    }

    pub fn with_column_family<C: Into<String>>(session: Arc<dyn Session>, column_family: C) -> Self {
        Self {
            session,
            column_family: column_family.into(),
        }
    }

    pub fn column_family(&self) -> &str {
        &self.column_family
    }
}

fn row_columns(row: Row) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut columns = BTreeMap::new();
    for (name, value) in row {
        if name == SERIES_KEY || name == TIME_KEY {
            continue;
        }
        match value {
            CqlValue::Blob(data) => {
                columns.insert(name, data);
            }
            other => {
                return Err(AionError::decode(
                    name,
                    format!("expected a blob column, found {other:?}"),
                ))
            }
        }
    }
    Ok(columns)
}

impl Repository for CqlRepository {
    fn put(
        &self,
        series: Uuid,
        granularity: Duration,
        bucket_start: DateTime<Utc>,
        attributes: &[EncodedBucketAttribute],
    ) -> Result<()> {
        let mut values: Row = attributes
            .iter()
            .map(|a| (a.name.clone(), CqlValue::Blob(a.data.clone())))
            .collect();
        values.insert(
            SERIES_KEY.to_string(),
            CqlValue::Text(partition_key(series, granularity)),
        );
        values.insert(TIME_KEY.to_string(), CqlValue::BigInt(bucket_start.timestamp()));
        // Inserts upsert, so the old row goes first or columns missing from
        // the new payload would survive.
        let delete = Delete {
            column_family: self.column_family.clone(),
            partition: partition_key(series, granularity),
            clustering: bucket_start.timestamp(),
        };
        let statement = Insert {
            column_family: self.column_family.clone(),
            values,
        };
        debug!(cql = %statement.to_cql(), start = bucket_start.timestamp(), "Bucket insert");
        self.session.delete(&delete)?;
        self.session.insert(&statement)?;
        Ok(())
    }

    fn query(&self, query: &BucketQuery, entries: Sender<Entry>, errors: Sender<AionError>) {
        let mut columns = vec![TIME_KEY.to_string(), TIME_ATTRIBUTE.to_string()];
        columns.extend(query.attributes.iter().cloned());
        let statement = Select {
            column_family: self.column_family.clone(),
            columns,
            partition: query.partition_key(),
            lower: Bound::Included(query.first_bucket()),
            upper: Bound::Excluded(query.end_unix()),
        };
        let rows = match self.session.select(&statement) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(cql = %statement.to_cql(), error = %e, "Bucket select failed");
                let _ = errors.send(AionError::Backend(e));
                return;
            }
        };
        debug!(partition = %statement.partition, buckets = rows.len(), "Bucket select");

        for row in rows {
            let Some(CqlValue::BigInt(start)) = row.get(TIME_KEY).cloned() else {
                warn!(partition = %statement.partition, "Bucket row without a bigint clustering key");
                if errors
                    .send(AionError::decode(TIME_KEY, "row has no bigint clustering key"))
                    .is_err()
                {
                    return;
                }
                continue;
            };
            if !emit_bucket(query, start, row_columns(row), &entries, &errors) {
                return;
            }
        }
    }

    fn get(
        &self,
        series: Uuid,
        granularity: Duration,
        bucket_start: DateTime<Utc>,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        let start = bucket_start.timestamp();
        let rows = self.session.select(&Select {
            column_family: self.column_family.clone(),
            columns: Vec::new(),
            partition: partition_key(series, granularity),
            lower: Bound::Included(start),
            upper: Bound::Included(start),
        })?;
        rows.into_iter().next().map(row_columns).transpose()
    }
}

// --- Cache table ---

/// Cache records as rows of a column family: text columns, one per attribute.
#[derive(Clone)]
pub struct CqlCacheTable {
    session: Arc<dyn Session>,
    column_family: String,
}

impl CqlCacheTable {
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self::with_column_family(session, DEFAULT_CACHE_FAMILY)
    }

    pub fn with_column_family<C: Into<String>>(session: Arc<dyn Session>, column_family: C) -> Self {
        Self {
            session,
            column_family: column_family.into(),
        }
    }
}

impl CacheTable for CqlCacheTable {
    fn insert_record(
        &self,
        series: Uuid,
        timestamp: i64,
        fields: &[(String, String)],
    ) -> anyhow::Result<()> {
        let mut values: Row = fields
            .iter()
            .map(|(name, text)| (name.clone(), CqlValue::Text(text.clone())))
            .collect();
        values.insert(SERIES_KEY.to_string(), CqlValue::Text(series.to_string()));
        values.insert(TIME_KEY.to_string(), CqlValue::BigInt(timestamp));
        self.session.insert(&Insert {
            column_family: self.column_family.clone(),
            values,
        })
    }

    fn scan_records(&self, series: Uuid, start: i64, end: i64) -> anyhow::Result<Vec<CacheRecord>> {
        let rows = self.session.select(&Select {
            column_family: self.column_family.clone(),
            columns: Vec::new(),
            partition: series.to_string(),
            lower: Bound::Included(start),
            upper: Bound::Included(end),
        })?;
        Ok(rows
            .into_iter()
            .map(|mut row| {
                let time = row.remove(TIME_KEY).map(|v| v.to_text()).unwrap_or_default();
                row.remove(SERIES_KEY);
                CacheRecord {
                    time,
                    fields: row
                        .into_iter()
                        .map(|(name, value)| (name, value.to_text()))
                        .collect(),
                }
            })
            .collect())
    }
}
