use std::{sync::Arc, time::Instant};

use aion::{
    bucket_start, from_unix, Backends, CacheStore, CascadeConfig, CqlCacheTable, DynamoRepository,
    Entry, Level, MemorySession, MemoryTable, DEFAULT_STREAM_CAPACITY,
};
use anyhow::{anyhow, Result};
use chrono::Utc;
use tempfile::tempdir;
use tracing::{info, info_span, warn};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

const CASCADE: &str = r#"{
    "levels": [
        {
            "filter": { "priority": 0, "pass_through": ["raw"] },
            "store": { "type": "Cache" }
        },
        {
            "filter": { "priority": 1 },
            "store": { "type": "Bucket", "granularity_secs": 60, "duration_secs": 3600, "multiplier": 100.0 },
            "aggregations": ["avg", "min", "max", "count"]
        }
    ]
}"#;

const SAMPLES: i64 = 2 * 3600;

// Function to initialize tracing
fn setup_logging() {
    let filter = EnvFilter::from_default_env()
        .add_directive("aion_example=info".parse().unwrap())
        .add_directive("aion=info".parse().unwrap());

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Synthetic sensor reading: a slow daily swing plus a faster ripple.
fn reading(t: i64) -> f64 {
    let t = t as f64;
    20.0 + 5.0 * (t / 86_400.0 * std::f64::consts::TAU).sin() + 0.3 * (t / 97.0).cos()
}

fn drain(level: &Level, series: Uuid, start: i64, end: i64, attributes: &[&str]) -> Result<Vec<Entry>> {
    let attributes: Vec<String> = attributes.iter().map(|a| a.to_string()).collect();
    let timer = Instant::now();
    let (entries, errors) = level
        .query_stream(
            series,
            from_unix(start)?,
            from_unix(end)?,
            &attributes,
            DEFAULT_STREAM_CAPACITY,
        )?
        .collect();
    for error in &errors {
        warn!(%error, "Query error");
    }
    info!(
        priority = level.filter().priority(),
        entries = entries.len(),
        errors = errors.len(),
        elapsed = ?timer.elapsed(),
        "Query drained"
    );
    Ok(entries)
}

fn main() -> Result<()> {
    setup_logging();

    let temp_dir = tempdir()?;
    let bucket_snapshot = temp_dir.path().join("buckets.json");
    let cache_snapshot = temp_dir.path().join("cache.json");
    info!("Using temp directory for snapshots: {:?}", temp_dir.path());

    let config = CascadeConfig::from_json_str(CASCADE)?;
    let table = Arc::new(MemoryTable::new());
    let session = Arc::new(MemorySession::new());
    let backends = Backends {
        repository: Arc::new(DynamoRepository::new(table.clone())),
        cache: Arc::new(CacheStore::new(CqlCacheTable::new(session.clone()))),
    };
    let levels = config.build(&backends)?;
    let (raw_level, aggregate_level) = match levels.as_slice() {
        [raw, aggregate] => (raw, aggregate),
        _ => return Err(anyhow!("expected a two-level cascade")),
    };
    let mut aggregator = config
        .levels
        .iter()
        .find_map(|level| level.aggregator("raw").transpose())
        .ok_or_else(|| anyhow!("cascade has no aggregating level"))??;

    let series = Uuid::new_v4();
    let start = bucket_start(Utc::now().timestamp(), 3600) - SAMPLES;
    let end = start + SAMPLES;

    {
        let _span = info_span!("ingest", %series, samples = SAMPLES).entered();
        let timer = Instant::now();
        let mut windows = Vec::new();
        for t in start..end {
            let entry = Entry::at(t)?.with("raw", reading(t));
            raw_level.insert(series, &entry)?;
            windows.extend(aggregator.push(&entry));
        }
        windows.extend(aggregator.flush());
        aggregate_level.put(series, &windows)?;
        info!(windows = windows.len(), elapsed = ?timer.elapsed(), "Ingest finished");
    }

    let raw_entries = drain(raw_level, series, end - 300, end - 1, &["raw"])?;
    let aggregates = drain(aggregate_level, series, start, end, &["avg", "min", "max", "count"])?;
    if let Some(first) = aggregates.first() {
        info!("First aggregate window: {}", serde_json::to_string(first)?);
    }
    info!(recent_raw = raw_entries.len(), "Cascade queried");

    table.save(&bucket_snapshot)?;
    session.save(&cache_snapshot)?;

    // Reopen both tiers from their snapshots and read the buckets back.
    let restored = Backends {
        repository: Arc::new(DynamoRepository::new(Arc::new(MemoryTable::load(&bucket_snapshot)?))),
        cache: Arc::new(CacheStore::new(CqlCacheTable::new(Arc::new(MemorySession::load(
            &cache_snapshot,
        )?)))),
    };
    let restored_levels = config.build(&restored)?;
    let reread = drain(&restored_levels[1], series, start, end, &["avg", "count"])?;
    if reread.len() != aggregates.len() {
        return Err(anyhow!(
            "restored tier returned {} windows, expected {}",
            reread.len(),
            aggregates.len()
        ));
    }

    info!("Main function finished.");
    Ok(())
}
