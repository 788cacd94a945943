//! Key-value backend with a hash key, a numeric range key and typed attributes.
//!
//! Buckets live in one item per (partition key, bucket start). Encoded columns
//! are stored as base64 binary attributes; the time column goes under
//! [`TIME_ATTRIBUTE`]. Cache records live in a separate table keyed by the bare
//! series id.

use std::{
    collections::BTreeMap,
    ops::Bound,
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, bail};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use crossbeam::channel::Sender;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    cache::{CacheRecord, CacheTable},
    error::{AionError, Result},
    repository::{emit_bucket, BucketQuery, Repository},
    types::{partition_key, EncodedBucketAttribute, Entry, SERIES_KEY, TIME_ATTRIBUTE, TIME_KEY},
};

/// A typed attribute value. Numbers travel as decimal text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    S(String),
    N(String),
    /// Base64 text of the binary payload.
    B(String),
}

impl AttributeValue {
    pub fn number(value: i64) -> Self {
        AttributeValue::N(value.to_string())
    }

    pub fn binary(data: &[u8]) -> Self {
        AttributeValue::B(STANDARD.encode(data))
    }

    /// The raw text of the value, whatever its type.
    pub fn as_text(&self) -> &str {
        match self {
            AttributeValue::S(s) | AttributeValue::N(s) | AttributeValue::B(s) => s,
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            AttributeValue::N(n) => n.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn decode_binary(&self) -> Result<Vec<u8>> {
        match self {
            AttributeValue::B(b) => Ok(STANDARD.decode(b)?),
            other => Err(AionError::decode(
                "binary",
                format!("expected a binary attribute, found {other:?}"),
            )),
        }
    }
}

pub type Item = BTreeMap<String, AttributeValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// One key condition of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCondition {
    pub attribute: String,
    pub operator: ComparisonOperator,
    pub value: AttributeValue,
}

impl KeyCondition {
    pub fn new<A: Into<String>>(attribute: A, operator: ComparisonOperator, value: AttributeValue) -> Self {
        Self {
            attribute: attribute.into(),
            operator,
            value,
        }
    }
}

/// The slice of a wide-column table client the repositories use.
pub trait ItemTable: Send + Sync {
    /// Writes `item` under (`hash_key`, `range_key`), replacing any previous
    /// item with the same keys.
    fn put_item(&self, hash_key: &str, range_key: i64, item: Item) -> anyhow::Result<()>;

    /// Items matching every condition, ascending by range key. Exactly one
    /// `Eq` condition on the hash key is required.
    fn query(&self, conditions: &[KeyCondition]) -> anyhow::Result<Vec<Item>>;
}

// --- In-memory table ---

type Partitions = BTreeMap<String, BTreeMap<i64, Item>>;

/// Table kept in memory, with optional JSON snapshots.
#[derive(Debug, Default)]
pub struct MemoryTable {
    partitions: RwLock<Partitions>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a table from a snapshot written by [`MemoryTable::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            AionError::Persistence(format!("Failed to open table snapshot {:?}: {}", path, e))
        })?;
        let partitions: Partitions = serde_json::from_reader(file).map_err(|e| {
            AionError::Persistence(format!(
                "Failed to deserialize table snapshot {:?}: {}",
                path, e
            ))
        })?;
        info!(path = ?path, partitions = partitions.len(), "Loaded table snapshot");
        Ok(Self {
            partitions: RwLock::new(partitions),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let partitions = self.partitions.read();
        let file = std::fs::File::create(path).map_err(|e| {
            AionError::Persistence(format!("Failed to create table snapshot {:?}: {}", path, e))
        })?;
        serde_json::to_writer_pretty(file, &*partitions).map_err(|e| {
            AionError::Persistence(format!(
                "Failed to serialize table snapshot to {:?}: {}",
                path, e
            ))
        })?;
        debug!(path = ?path, partitions = partitions.len(), "Saved table snapshot");
        Ok(())
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.read().len()
    }

    /// Range keys stored under `hash_key`, ascending.
    pub fn range_keys(&self, hash_key: &str) -> Vec<i64> {
        self.partitions
            .read()
            .get(hash_key)
            .map(|items| items.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn get_item(&self, hash_key: &str, range_key: i64) -> Option<Item> {
        self.partitions
            .read()
            .get(hash_key)
            .and_then(|items| items.get(&range_key))
            .cloned()
    }
}

impl ItemTable for MemoryTable {
    fn put_item(&self, hash_key: &str, range_key: i64, mut item: Item) -> anyhow::Result<()> {
        item.insert(SERIES_KEY.to_string(), AttributeValue::S(hash_key.to_string()));
        item.insert(TIME_KEY.to_string(), AttributeValue::number(range_key));
        self.partitions
            .write()
            .entry(hash_key.to_string())
            .or_default()
            .insert(range_key, item);
        Ok(())
    }

    fn query(&self, conditions: &[KeyCondition]) -> anyhow::Result<Vec<Item>> {
        let mut hash_key = None;
        let mut lower = Bound::Unbounded;
        let mut upper = Bound::Unbounded;
        for condition in conditions {
            match (condition.attribute.as_str(), condition.operator) {
                (SERIES_KEY, ComparisonOperator::Eq) => {
                    hash_key = Some(condition.value.as_text().to_string())
                }
                (TIME_KEY, op) => {
                    let value = condition
                        .value
                        .as_number()
                        .ok_or_else(|| anyhow!("range key condition needs a number"))?;
                    match op {
                        ComparisonOperator::Eq => {
                            lower = Bound::Included(value);
                            upper = Bound::Included(value);
                        }
                        ComparisonOperator::Ge => lower = Bound::Included(value),
                        ComparisonOperator::Gt => lower = Bound::Excluded(value),
                        ComparisonOperator::Le => upper = Bound::Included(value),
                        ComparisonOperator::Lt => upper = Bound::Excluded(value),
                    }
                }
                (attribute, op) => bail!("unsupported key condition {attribute} {op:?}"),
            }
        }
        let Some(hash_key) = hash_key else {
            bail!("query requires an equality condition on '{SERIES_KEY}'");
        };
        if let (Bound::Included(lo) | Bound::Excluded(lo), Bound::Included(hi) | Bound::Excluded(hi)) =
            (lower, upper)
        {
            // BTreeMap::range panics on inverted bounds.
            if lo > hi {
                return Ok(Vec::new());
            }
        }

        let partitions = self.partitions.read();
        Ok(partitions
            .get(&hash_key)
            .map(|items| items.range((lower, upper)).map(|(_, item)| item.clone()).collect())
            .unwrap_or_default())
    }
}

// --- Repository ---

/// Bucket repository over an [`ItemTable`].
#[derive(Clone)]
pub struct DynamoRepository {
    table: Arc<dyn ItemTable>,
}

impl DynamoRepository {
    pub fn new(table: Arc<dyn ItemTable>) -> Self {
        Self { table }
    }
}

/// Decoded binary columns of a bucket item; `wanted` of `None` keeps them all.
fn item_columns(item: &Item, wanted: Option<&[String]>) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut columns = BTreeMap::new();
    for (name, value) in item {
        if name == SERIES_KEY || name == TIME_KEY {
            continue;
        }
        if let Some(wanted) = wanted {
            if name != TIME_ATTRIBUTE && !wanted.contains(name) {
                continue;
            }
        }
        let data = value.decode_binary().map_err(|e| match e {
            AionError::Base64(inner) => AionError::decode(name.as_str(), inner.to_string()),
            other => other,
        })?;
        columns.insert(name.clone(), data);
    }
    Ok(columns)
}

impl Repository for DynamoRepository {
    fn put(
        &self,
        series: Uuid,
        granularity: Duration,
        bucket_start: DateTime<Utc>,
        attributes: &[EncodedBucketAttribute],
    ) -> Result<()> {
        let hash_key = partition_key(series, granularity);
        let item: Item = attributes
            .iter()
            .map(|a| (a.name.clone(), AttributeValue::binary(&a.data)))
            .collect();
        debug!(%hash_key, start = bucket_start.timestamp(), columns = item.len(), "PutItem");
        self.table
            .put_item(&hash_key, bucket_start.timestamp(), item)?;
        Ok(())
    }

    fn query(&self, query: &BucketQuery, entries: Sender<Entry>, errors: Sender<AionError>) {
        let hash_key = query.partition_key();
        let conditions = [
            KeyCondition::new(SERIES_KEY, ComparisonOperator::Eq, AttributeValue::S(hash_key.clone())),
            KeyCondition::new(
                TIME_KEY,
                ComparisonOperator::Ge,
                AttributeValue::number(query.first_bucket()),
            ),
            KeyCondition::new(
                TIME_KEY,
                ComparisonOperator::Lt,
                AttributeValue::number(query.end_unix()),
            ),
        ];
        let items = match self.table.query(&conditions) {
            Ok(items) => items,
            Err(e) => {
                warn!(%hash_key, error = %e, "Bucket query failed");
                let _ = errors.send(AionError::Backend(e));
                return;
            }
        };
        debug!(%hash_key, buckets = items.len(), "Bucket query");

        for item in items {
            let Some(start) = item.get(TIME_KEY).and_then(AttributeValue::as_number) else {
                warn!(%hash_key, "Bucket item without a numeric range key");
                if errors
                    .send(AionError::decode(TIME_KEY, "item has no numeric range key"))
                    .is_err()
                {
                    return;
                }
                continue;
            };
            let columns = item_columns(&item, Some(&query.attributes));
            if !emit_bucket(query, start, columns, &entries, &errors) {
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
        let conditions = [
            KeyCondition::new(
                SERIES_KEY,
                ComparisonOperator::Eq,
                AttributeValue::S(partition_key(series, granularity)),
            ),
            KeyCondition::new(
                TIME_KEY,
                ComparisonOperator::Eq,
                AttributeValue::number(bucket_start.timestamp()),
            ),
        ];
        match self.table.query(&conditions)?.first() {
            Some(item) => Ok(Some(item_columns(item, None)?)),
            None => Ok(None),
        }
    }
}

// --- Cache table ---

/// Cache records as items: hash key is the series id, range key the
/// timestamp, every attribute a number.
#[derive(Clone)]
pub struct DynamoCacheTable {
    table: Arc<dyn ItemTable>,
}

impl DynamoCacheTable {
    pub fn new(table: Arc<dyn ItemTable>) -> Self {
        Self { table }
    }
}

impl CacheTable for DynamoCacheTable {
    fn insert_record(
        &self,
        series: Uuid,
        timestamp: i64,
        fields: &[(String, String)],
    ) -> anyhow::Result<()> {
        let item: Item = fields
            .iter()
            .map(|(name, text)| (name.clone(), AttributeValue::N(text.clone())))
            .collect();
        self.table.put_item(&series.to_string(), timestamp, item)
    }

    fn scan_records(&self, series: Uuid, start: i64, end: i64) -> anyhow::Result<Vec<CacheRecord>> {
        let conditions = [
            KeyCondition::new(SERIES_KEY, ComparisonOperator::Eq, AttributeValue::S(series.to_string())),
            KeyCondition::new(TIME_KEY, ComparisonOperator::Ge, AttributeValue::number(start)),
            KeyCondition::new(TIME_KEY, ComparisonOperator::Le, AttributeValue::number(end)),
        ];
        let items = self.table.query(&conditions)?;
        Ok(items
            .into_iter()
            .map(|mut item| {
                let time = item
                    .remove(TIME_KEY)
                    .map(|v| v.as_text().to_string())
                    .unwrap_or_default();
                item.remove(SERIES_KEY);
                CacheRecord {
                    time,
                    fields: item
                        .into_iter()
                        .map(|(name, value)| (name, value.as_text().to_string()))
                        .collect(),
                }
            })
            .collect())
    }
}
