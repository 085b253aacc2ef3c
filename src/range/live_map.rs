//! Directory of the ranges a node currently owns
//!
//! Ranges are indexed per table by end row, which makes the containing
//! range of a row the first range whose end row is not below it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::range::Range;
use super::spec::{QualifiedRangeSpec, TableIdentifier, END_ROW_MARKER};

/// Ranges of one table.
#[derive(Debug)]
pub struct TableInfo {
    pub identifier: TableIdentifier,
    ranges: BTreeMap<String, Arc<Range>>,
}

impl TableInfo {
    fn new(identifier: TableIdentifier) -> Self {
        Self {
            identifier,
            ranges: BTreeMap::new(),
        }
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    fn find_containing(&self, row: &str) -> Option<Arc<Range>> {
        let (_, range) = self.ranges.range(row.to_string()..).next()?;
        if range.spec().range.contains(row) {
            Some(range.clone())
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
pub struct LiveRangeTable {
    tables: Mutex<BTreeMap<String, TableInfo>>,
}

impl LiveRangeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `range`; returns `false` if a range with the same identity is
    /// already present.
    pub fn add_range(&self, range: Arc<Range>) -> bool {
        let spec = range.spec();
        let mut tables = self.tables.lock().unwrap();
        Self::insert_locked(&mut tables, spec, range)
    }

    fn insert_locked(
        tables: &mut BTreeMap<String, TableInfo>,
        spec: QualifiedRangeSpec,
        range: Arc<Range>,
    ) -> bool {
        let info = tables
            .entry(spec.table.id.clone())
            .or_insert_with(|| TableInfo::new(spec.table.clone()));
        if spec.table.generation > info.identifier.generation {
            info.identifier.generation = spec.table.generation;
        }
        if info.ranges.contains_key(&spec.range.end_row) {
            return false;
        }
        info.ranges.insert(spec.range.end_row.clone(), range);
        true
    }

    pub fn get_range(&self, spec: &QualifiedRangeSpec) -> Option<Arc<Range>> {
        let tables = self.tables.lock().unwrap();
        let range = tables.get(&spec.table.id)?.ranges.get(&spec.range.end_row)?;
        if range.spec() == *spec {
            Some(range.clone())
        } else {
            None
        }
    }

    pub fn has_range(&self, spec: &QualifiedRangeSpec) -> bool {
        self.get_range(spec).is_some()
    }

    /// Whether every range in `specs` is live.
    pub fn live(&self, specs: &[QualifiedRangeSpec]) -> bool {
        specs.iter().all(|spec| self.has_range(spec))
    }

    pub fn has_table(&self, table_id: &str) -> bool {
        self.tables.lock().unwrap().contains_key(table_id)
    }

    pub fn table_identifier(&self, table_id: &str) -> Option<TableIdentifier> {
        self.tables
            .lock()
            .unwrap()
            .get(table_id)
            .map(|t| t.identifier.clone())
    }

    /// Range of `table_id` whose boundaries contain `row`.
    pub fn find_containing_range(&self, table_id: &str, row: &str) -> Option<Arc<Range>> {
        self.tables.lock().unwrap().get(table_id)?.find_containing(row)
    }

    pub fn remove_range(&self, spec: &QualifiedRangeSpec) -> Option<Arc<Range>> {
        let mut tables = self.tables.lock().unwrap();
        let info = tables.get_mut(&spec.table.id)?;
        let removed = info.ranges.remove(&spec.range.end_row);
        if info.ranges.is_empty() {
            tables.remove(&spec.table.id);
        }
        removed
    }

    pub fn ranges(&self) -> Vec<Arc<Range>> {
        self.tables
            .lock()
            .unwrap()
            .values()
            .flat_map(|t| t.ranges.values().cloned())
            .collect()
    }

    pub fn specs(&self) -> Vec<QualifiedRangeSpec> {
        self.ranges().iter().map(|r| r.spec()).collect()
    }

    pub fn range_count(&self) -> usize {
        self.tables
            .lock()
            .unwrap()
            .values()
            .map(TableInfo::range_count)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.range_count() == 0
    }

    /// Moves every range of `other` into this table.
    ///
    /// Ranges whose identity is already live are left out. Returns the
    /// number of ranges added.
    pub fn merge(&self, other: LiveRangeTable) -> usize {
        self.merge_with(other, || Ok::<(), std::convert::Infallible>(()))
            .unwrap_or(0)
    }

    /// Runs `persist` and, if it succeeds, merges `other`, all while
    /// holding this table's lock. Nothing is merged when `persist` fails.
    pub fn merge_with<E, F>(&self, other: LiveRangeTable, persist: F) -> Result<usize, E>
    where
        F: FnOnce() -> Result<(), E>,
    {
        let incoming = other.tables.into_inner().unwrap();
        let mut tables = self.tables.lock().unwrap();
        persist()?;
        let mut added = 0;
        for info in incoming.into_values() {
            for range in info.ranges.into_values() {
                if Self::insert_locked(&mut tables, range.spec(), range) {
                    added += 1;
                }
            }
        }
        Ok(added)
    }
}

/// A break in the row-space partition of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionIssue {
    /// No range covers the rows between `after` and `before`
    Gap {
        table: String,
        after: String,
        before: String,
    },
    /// Two ranges cover some of the same rows
    Overlap {
        table: String,
        first: String,
        second: String,
    },
}

impl PartitionIssue {
    pub fn table(&self) -> &str {
        match self {
            PartitionIssue::Gap { table, .. } | PartitionIssue::Overlap { table, .. } => table,
        }
    }
}

impl std::fmt::Display for PartitionIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionIssue::Gap { table, after, before } => {
                write!(f, "gap in table {} between {:?} and {:?}", table, after, before)
            }
            PartitionIssue::Overlap { table, first, second } => {
                write!(f, "overlap in table {} between {} and {}", table, first, second)
            }
        }
    }
}

/// Checks that, per table, `specs` tile the row space from the empty row to
/// `END_ROW_MARKER` with no gap and no overlap.
///
/// Only reports; no range is changed.
pub fn verify_partition<I>(specs: I) -> Vec<PartitionIssue>
where
    I: IntoIterator<Item = QualifiedRangeSpec>,
{
    let mut by_table: BTreeMap<String, Vec<QualifiedRangeSpec>> = BTreeMap::new();
    for spec in specs {
        by_table.entry(spec.table.id.clone()).or_default().push(spec);
    }

    let mut issues = Vec::new();
    for (table, mut specs) in by_table {
        specs.sort_by(|a, b| {
            (&a.range.start_row, &a.range.end_row).cmp(&(&b.range.start_row, &b.range.end_row))
        });
        let mut covered_to = String::new();
        let mut previous: Option<&QualifiedRangeSpec> = None;
        for spec in &specs {
            let start = &spec.range.start_row;
            if *start > covered_to {
                issues.push(PartitionIssue::Gap {
                    table: table.clone(),
                    after: covered_to.clone(),
                    before: start.clone(),
                });
            } else if *start < covered_to {
                if let Some(prev) = previous {
                    issues.push(PartitionIssue::Overlap {
                        table: table.clone(),
                        first: prev.name(),
                        second: spec.name(),
                    });
                }
            }
            if spec.range.end_row > covered_to {
                covered_to = spec.range.end_row.clone();
            }
            previous = Some(spec);
        }
        if covered_to != END_ROW_MARKER {
            issues.push(PartitionIssue::Gap {
                table: table.clone(),
                after: covered_to,
                before: END_ROW_MARKER.to_string(),
            });
        }
    }
    issues
}
