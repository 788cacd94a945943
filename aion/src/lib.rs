//! Storage core of a time-series database.
//!
//! Samples of a series are packed into fixed-duration buckets, one
//! fixed-point delta-encoded column per attribute, and persisted through a
//! [`Repository`] onto a wide-column backend. A [`CacheStore`] keeps single
//! unquantized records for the low-latency tier. A [`Level`] binds an
//! [`AggregateFilter`] to a store; several levels form a retention cascade.
//!
//! Reads stream entries and errors over two channels. A bucket that fails to
//! decode is reported once and skipped; the rest of the range is delivered.

pub mod aggregate;
pub mod cache;
pub mod codec;
pub mod config;
pub mod cql;
pub mod dynamodb;
pub mod error;
pub mod filter;
pub mod iterator;
pub mod level;
pub mod repository;
pub mod store;
pub mod types;

// --- Main Library Exports ---
pub use crate::{
    aggregate::{Aggregation, Aggregator},
    cache::{CacheRecord, CacheStore, CacheTable},
    codec::{dequantize, quantize, BucketDecoder, BucketEncoder},
    config::{Backends, BucketStoreConfig, CascadeConfig, FilterConfig, LevelConfig, StoreKind},
    cql::{CqlCacheTable, CqlRepository, Delete, MemorySession, Session},
    dynamodb::{DynamoCacheTable, DynamoRepository, ItemTable, MemoryTable},
    error::{AionError, Result, WriteFailure},
    filter::{AggregateFilter, Routing},
    iterator::BucketEntryReader,
    level::{Level, QueryStream, DEFAULT_STREAM_CAPACITY},
    repository::{BucketQuery, Repository},
    store::{BucketStore, Store},
    types::{bucket_start, from_unix, partition_key, EncodedBucketAttribute, Entry},
};
