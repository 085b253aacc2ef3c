//! Receiver plan
//!
//! The master's assignment of a failed node's ranges to surviving nodes:
//! table -> end row -> destination. Replaying nodes look every scanned pair
//! up here to find where it goes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::range::{QualifiedRangeSpec, RangeState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverEntry {
    /// Surviving node taking the range over
    pub location: String,
    pub spec: QualifiedRangeSpec,
    pub state: RangeState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverPlan {
    tables: BTreeMap<String, BTreeMap<String, ReceiverEntry>>,
}

impl ReceiverPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns `spec` to `location`, replacing an earlier assignment of the
    /// same range.
    pub fn add(&mut self, location: impl Into<String>, spec: QualifiedRangeSpec, state: RangeState) {
        self.tables
            .entry(spec.table.id.clone())
            .or_default()
            .insert(
                spec.range.end_row.clone(),
                ReceiverEntry {
                    location: location.into(),
                    spec,
                    state,
                },
            );
    }

    /// Entry whose range contains `row` of `table_id`.
    pub fn lookup(&self, table_id: &str, row: &str) -> Option<&ReceiverEntry> {
        self.tables
            .get(table_id)?
            .range(row.to_string()..)
            .next()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.spec.range.contains(row))
    }

    pub fn entries(&self) -> impl Iterator<Item = &ReceiverEntry> {
        self.tables.values().flat_map(|ranges| ranges.values())
    }

    pub fn locations(&self) -> BTreeSet<String> {
        self.entries().map(|e| e.location.clone()).collect()
    }

    /// Ranges assigned to `location`.
    pub fn specs_for(&self, location: &str) -> Vec<QualifiedRangeSpec> {
        self.entries()
            .filter(|e| e.location == location)
            .map(|e| e.spec.clone())
            .collect()
    }

    pub fn states_for(&self, location: &str) -> Vec<RangeState> {
        self.entries()
            .filter(|e| e.location == location)
            .map(|e| e.state.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
