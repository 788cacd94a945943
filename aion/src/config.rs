//! Serializable description of a retention cascade.
//!
//! Durations are whole seconds. A config is checked with `validate` and then
//! turned into runtime values against backend handles supplied by the caller.

use std::{path::Path, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    aggregate::{Aggregation, Aggregator},
    error::{AionError, Result},
    filter::AggregateFilter,
    level::Level,
    repository::Repository,
    store::{BucketStore, Store},
    types::check_attribute_name,
};

/// The whole cascade: one entry per level.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CascadeConfig {
    pub levels: Vec<LevelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LevelConfig {
    pub filter: FilterConfig,
    pub store: StoreKind,
    /// Window aggregates this level expects from upstream. Empty for raw tiers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregations: Vec<Aggregation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FilterConfig {
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub pass_through: Vec<String>,
}

/// Which kind of store backs a level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum StoreKind {
    Cache,
    Bucket(BucketStoreConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BucketStoreConfig {
    pub granularity_secs: u64,
    pub duration_secs: u64,
    pub multiplier: f64,
}

impl Default for BucketStoreConfig {
    fn default() -> Self {
        Self {
            granularity_secs: 60,
            duration_secs: 600,
            multiplier: 10.0,
        }
    }
}

/// Backend handles a level can be built on. Only the one matching the
/// level's [`StoreKind`] is used.
#[derive(Clone)]
pub struct Backends {
    pub repository: Arc<dyn Repository>,
    pub cache: Arc<dyn Store>,
}

impl CascadeConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            AionError::Persistence(format!("Failed to open cascade config {:?}: {}", path, e))
        })?;
        let config: Self = serde_json::from_reader(file)?;
        config.validate()?;
        info!(path = ?path, levels = config.levels.len(), "Loaded cascade config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.levels.is_empty() {
            return Err(AionError::InvalidConfig("cascade has no levels".to_string()));
        }
        let mut priorities: Vec<i32> = self.levels.iter().map(|l| l.filter.priority).collect();
        priorities.sort_unstable();
        if priorities.windows(2).any(|w| w[0] == w[1]) {
            return Err(AionError::InvalidConfig(
                "level priorities must be unique".to_string(),
            ));
        }
        self.levels.iter().try_for_each(LevelConfig::validate)
    }

    /// Builds every level, ordered by priority.
    pub fn build(&self, backends: &Backends) -> Result<Vec<Level>> {
        let mut levels = self
            .levels
            .iter()
            .map(|config| config.build(backends))
            .collect::<Result<Vec<_>>>()?;
        levels.sort_by_key(|level| level.filter().priority());
        Ok(levels)
    }
}

impl LevelConfig {
    pub fn validate(&self) -> Result<()> {
        for name in &self.filter.pass_through {
            check_attribute_name(name)?;
        }
        if self.aggregations.contains(&Aggregation::Raw) {
            return Err(AionError::InvalidConfig(
                "'raw' belongs in pass_through, not aggregations".to_string(),
            ));
        }
        match &self.store {
            StoreKind::Cache if !self.aggregations.is_empty() => Err(AionError::InvalidConfig(
                "cache levels hold raw samples only".to_string(),
            )),
            StoreKind::Cache => Ok(()),
            StoreKind::Bucket(bucket) => bucket.validate(),
        }
    }

    pub fn build(&self, backends: &Backends) -> Result<Level> {
        self.validate()?;
        let filter = AggregateFilter::new(self.filter.priority, self.filter.pass_through.iter().cloned());
        let store: Arc<dyn Store> = match &self.store {
            StoreKind::Cache => Arc::clone(&backends.cache),
            StoreKind::Bucket(bucket) => Arc::new(bucket.build(Arc::clone(&backends.repository))?),
        };
        Ok(Level::new(filter, store))
    }

    /// The aggregator that produces this level's input from `source`, if the
    /// level holds aggregates.
    pub fn aggregator(&self, source: &str) -> Result<Option<Aggregator>> {
        match &self.store {
            StoreKind::Bucket(bucket) if !self.aggregations.is_empty() => Ok(Some(Aggregator::new(
                bucket.granularity(),
                self.aggregations.clone(),
                source,
            )?)),
            _ => Ok(None),
        }
    }
}

impl BucketStoreConfig {
    pub fn granularity(&self) -> Duration {
        Duration::from_secs(self.granularity_secs)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.granularity_secs == 0 {
            return Err(AionError::InvalidConfig(
                "granularity_secs must be positive".to_string(),
            ));
        }
        if self.duration_secs == 0 || self.duration_secs % self.granularity_secs != 0 {
            return Err(AionError::InvalidConfig(format!(
                "duration_secs {} is not a positive multiple of granularity_secs {}",
                self.duration_secs, self.granularity_secs
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier <= 0.0 {
            return Err(AionError::InvalidConfig(format!(
                "multiplier must be positive and finite, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    pub fn build(&self, repository: Arc<dyn Repository>) -> Result<BucketStore> {
        self.validate()?;
        BucketStore::new(self.granularity(), self.duration(), self.multiplier, repository)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CASCADE: &str = r#"{
        "levels": [
            {
                "filter": { "priority": 1 },
                "store": { "type": "Bucket", "granularity_secs": 60, "duration_secs": 3600, "multiplier": 100.0 },
                "aggregations": ["avg", "max", "count"]
            },
            {
                "filter": { "priority": 0, "pass_through": ["raw"] },
                "store": { "type": "Cache" }
            }
        ]
    }"#;

    #[test]
    fn parses_cascade() -> Result<()> {
        let config = CascadeConfig::from_json_str(CASCADE)?;
        assert_eq!(config.levels.len(), 2);
        assert_eq!(
            config.levels[0].store,
            StoreKind::Bucket(BucketStoreConfig {
                granularity_secs: 60,
                duration_secs: 3600,
                multiplier: 100.0,
            })
        );
        assert_eq!(config.levels[1].store, StoreKind::Cache);
        assert_eq!(config.levels[1].filter.pass_through, vec!["raw".to_string()]);
        assert!(config.levels[0].aggregator("raw")?.is_some());
        assert!(config.levels[1].aggregator("raw")?.is_none());
        Ok(())
    }

    #[test]
    fn rejects_invalid_levels() {
        let bad_duration = CASCADE.replace("3600", "90");
        assert!(matches!(
            CascadeConfig::from_json_str(&bad_duration),
            Err(AionError::InvalidConfig(_))
        ));

        let reserved = CASCADE.replace(r#"["raw"]"#, r#"["times"]"#);
        assert!(matches!(
            CascadeConfig::from_json_str(&reserved),
            Err(AionError::ReservedAttribute(_))
        ));

        let duplicate = CASCADE.replace(r#""priority": 1"#, r#""priority": 0"#);
        assert!(CascadeConfig::from_json_str(&duplicate).is_err());

        assert!(matches!(
            CascadeConfig::from_json_str("{\"levels\": 3}"),
            Err(AionError::Json(_))
        ));
    }

    #[test]
    fn loads_from_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cascade.json");
        std::fs::write(&path, CASCADE)?;
        let config = CascadeConfig::from_path(&path)?;
        assert_eq!(config, CascadeConfig::from_json_str(CASCADE)?);
        Ok(())
    }
}
