//! Per-attribute routing for the entries entering a level.

use std::collections::BTreeSet;

use tracing::trace;

use crate::types::Entry;

/// How a tier treats one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Raw samples, stored unchanged.
    PassThrough,
    /// Expected to arrive already aggregated by an upstream step.
    Aggregated,
}

/// Routing decision for the attributes entering a level.
///
/// Holds nothing but its configuration, so one filter can be shared by any
/// number of writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateFilter {
    priority: i32,
    pass_through: BTreeSet<String>,
}

impl AggregateFilter {
    pub fn new<I, S>(priority: i32, pass_through: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            priority,
            pass_through: pass_through.into_iter().map(Into::into).collect(),
        }
    }

    /// Ordinal of the level in its cascade; lower runs first.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn pass_through(&self) -> &BTreeSet<String> {
        &self.pass_through
    }

    pub fn routing(&self, attribute: &str) -> Routing {
        if self.pass_through.contains(attribute) {
            Routing::PassThrough
        } else {
            Routing::Aggregated
        }
    }

    /// Entry as it should reach the store, or `None` when there is nothing
    /// to write. Both routes forward values unchanged.
    pub fn apply(&self, entry: &Entry) -> Option<Entry> {
        if entry.attributes.is_empty() {
            return None;
        }
        for name in entry.attributes.keys() {
            trace!(attribute = %name, routing = ?self.routing(name), "Routing attribute");
        }
        Some(entry.clone())
    }
}
