//! Window aggregation feeding the coarser levels of a cascade.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{AionError, Result},
    types::{bucket_start, from_unix, whole_seconds, Entry},
};

/// Attribute names a level can hold. `raw` is the unaggregated sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Raw,
    Avg,
    Min,
    Max,
    Sum,
    Count,
}

impl Aggregation {
    pub const ALL: [Aggregation; 6] = [
        Aggregation::Raw,
        Aggregation::Avg,
        Aggregation::Min,
        Aggregation::Max,
        Aggregation::Sum,
        Aggregation::Count,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Count => "count",
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Aggregation {
    type Err = AionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.name() == s)
            .ok_or_else(|| AionError::InvalidConfig(format!("unknown aggregation '{s}'")))
    }
}

/// Running summary of one window.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Summary {
    min: f64,
    max: f64,
    sum: f64,
    count: u64,
}

impl Summary {
    fn from_value(value: f64) -> Self {
        Self {
            min: value,
            max: value,
            sum: value,
            count: 1,
        }
    }

    fn accumulate(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
    }

    #[allow(clippy::cast_precision_loss)]
    fn value(&self, aggregation: Aggregation) -> f64 {
        match aggregation {
            Aggregation::Avg => self.sum / self.count as f64,
            Aggregation::Min => self.min,
            Aggregation::Max => self.max,
            Aggregation::Sum => self.sum,
            Aggregation::Count => self.count as f64,
            // Rejected by Aggregator::new.
            Aggregation::Raw => f64::NAN,
        }
    }
}

/// Folds one source attribute into fixed windows of `granularity`.
///
/// Entries must arrive in time order. A window is emitted when the first entry
/// of a later window arrives, or on [`Aggregator::flush`].
#[derive(Debug, Clone)]
pub struct Aggregator {
    granularity: i64,
    aggregations: Vec<Aggregation>,
    source_attribute: String,
    open: Option<(i64, Summary)>,
}

impl Aggregator {
    pub fn new<S: Into<String>>(
        granularity: Duration,
        aggregations: Vec<Aggregation>,
        source_attribute: S,
    ) -> Result<Self> {
        if granularity.subsec_nanos() != 0 || granularity.is_zero() {
            return Err(AionError::InvalidConfig(
                "aggregation granularity must be a positive whole number of seconds".to_string(),
            ));
        }
        if aggregations.is_empty() {
            return Err(AionError::InvalidConfig(
                "at least one aggregation is required".to_string(),
            ));
        }
        if aggregations.contains(&Aggregation::Raw) {
            return Err(AionError::InvalidConfig(
                "'raw' is not a window aggregation".to_string(),
            ));
        }
        Ok(Self {
            granularity: whole_seconds(granularity),
            aggregations,
            source_attribute: source_attribute.into(),
            open: None,
        })
    }

    /// Adds one entry; returns the previous window's aggregate if this entry
    /// closed it.
    pub fn push(&mut self, entry: &Entry) -> Option<Entry> {
        let value = entry.get(&self.source_attribute)?;
        let window = bucket_start(entry.unix(), self.granularity);
        match &mut self.open {
            Some((start, summary)) if *start == window => {
                summary.accumulate(value);
                None
            }
            Some((start, _)) if window < *start => {
                warn!(
                    timestamp = entry.unix(),
                    open_window = *start,
                    "Dropping entry older than the open aggregation window"
                );
                None
            }
            _ => {
                let closed = self.open.take();
                self.open = Some((window, Summary::from_value(value)));
                closed.and_then(|(start, summary)| self.emit(start, &summary))
            }
        }
    }

    /// Emits the open window, if any.
    pub fn flush(&mut self) -> Option<Entry> {
        let (start, summary) = self.open.take()?;
        self.emit(start, &summary)
    }

    fn emit(&self, start: i64, summary: &Summary) -> Option<Entry> {
        let mut entry = match from_unix(start) {
            Ok(timestamp) => Entry::new(timestamp),
            Err(e) => {
                warn!(start, error = %e, "Aggregation window outside the timestamp range");
                return None;
            }
        };
        for aggregation in &self.aggregations {
            entry
                .attributes
                .insert(aggregation.name().to_string(), summary.value(*aggregation));
        }
        debug!(start, samples = summary.count, "Closed aggregation window");
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(t: i64, value: f64) -> Entry {
        Entry::at(t).unwrap().with("raw", value)
    }

    fn minute(aggregations: Vec<Aggregation>) -> Aggregator {
        Aggregator::new(Duration::from_secs(60), aggregations, "raw").unwrap()
    }

    #[test]
    fn parses_names() {
        assert_eq!("avg".parse::<Aggregation>().unwrap(), Aggregation::Avg);
        assert!("median".parse::<Aggregation>().is_err());
        for aggregation in Aggregation::ALL {
            assert_eq!(aggregation.to_string().parse::<Aggregation>().unwrap(), aggregation);
        }
    }

    #[test]
    fn rejects_raw_and_empty() {
        let secs = Duration::from_secs(60);
        assert!(Aggregator::new(secs, vec![Aggregation::Raw], "raw").is_err());
        assert!(Aggregator::new(secs, vec![], "raw").is_err());
        assert!(Aggregator::new(Duration::ZERO, vec![Aggregation::Sum], "raw").is_err());
    }

    #[test]
    fn emits_window_when_next_window_starts() {
        let mut agg = minute(vec![
            Aggregation::Avg,
            Aggregation::Min,
            Aggregation::Max,
            Aggregation::Sum,
            Aggregation::Count,
        ]);
        assert_eq!(agg.push(&raw(0, 1.0)), None);
        assert_eq!(agg.push(&raw(20, 4.0)), None);
        assert_eq!(agg.push(&raw(59, 7.0)), None);

        let closed = agg.push(&raw(61, 10.0)).unwrap();
        assert_eq!(closed.unix(), 0);
        assert_eq!(closed.get("avg"), Some(4.0));
        assert_eq!(closed.get("min"), Some(1.0));
        assert_eq!(closed.get("max"), Some(7.0));
        assert_eq!(closed.get("sum"), Some(12.0));
        assert_eq!(closed.get("count"), Some(3.0));
        assert_eq!(closed.get("raw"), None);

        let last = agg.flush().unwrap();
        assert_eq!(last.unix(), 60);
        assert_eq!(last.get("count"), Some(1.0));
        assert_eq!(agg.flush(), None);
    }

    #[test]
    fn late_and_unrelated_entries_are_ignored() {
        let mut agg = minute(vec![Aggregation::Count]);
        agg.push(&raw(120, 1.0));
        assert_eq!(agg.push(&raw(30, 1.0)), None);
        assert_eq!(agg.push(&Entry::at(130).unwrap().with("other", 1.0)), None);
        assert_eq!(agg.flush().unwrap().get("count"), Some(1.0));
    }
}
