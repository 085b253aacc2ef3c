//! Table and range identifiers
//!
//! Rows compare byte-lexicographically. A range covers the half-open row
//! interval `(start_row, end_row]`; the empty start row is the lowest
//! possible start and `END_ROW_MARKER` the highest possible end.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Table id of the metadata table.
pub const METADATA_TABLE_ID: &str = "0";

/// End row of the root range (the first metadata range).
pub const END_ROOT_ROW: &str = "0:\u{10FFFF}";

/// End row of the last range of every table.
pub const END_ROW_MARKER: &str = "\u{10FFFF}\u{10FFFF}";

/// Commit-log class a table's mutations are written to.
///
/// The declaration order is the replay order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableClass {
    /// The root range of the metadata table
    Root,
    /// Every other metadata range
    Metadata,
    /// System tables other than metadata
    System,
    /// User tables
    User,
}

impl TableClass {
    /// All classes in replay order.
    pub const ALL: [TableClass; 4] = [
        TableClass::Root,
        TableClass::Metadata,
        TableClass::System,
        TableClass::User,
    ];

    /// Directory name of this class's commit log.
    pub fn as_str(&self) -> &'static str {
        match self {
            TableClass::Root => "root",
            TableClass::Metadata => "metadata",
            TableClass::System => "system",
            TableClass::User => "user",
        }
    }

    /// Position in replay order.
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Parse a class from its directory name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "root" => Some(TableClass::Root),
            "metadata" => Some(TableClass::Metadata),
            "system" => Some(TableClass::System),
            "user" => Some(TableClass::User),
            _ => None,
        }
    }
}

impl fmt::Display for TableClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Table id plus schema generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableIdentifier {
    pub id: String,
    pub generation: i64,
}

impl TableIdentifier {
    pub fn new(id: impl Into<String>, generation: i64) -> Self {
        Self {
            id: id.into(),
            generation,
        }
    }

    pub fn metadata() -> Self {
        Self::new(METADATA_TABLE_ID, 0)
    }

    pub fn is_metadata(&self) -> bool {
        self.id == METADATA_TABLE_ID
    }

    /// System tables include the metadata table.
    pub fn is_system(&self) -> bool {
        self.is_metadata() || self.id.starts_with("0/")
    }

    pub fn is_user(&self) -> bool {
        !self.is_system()
    }
}

impl fmt::Display for TableIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Row boundaries of a range: `(start_row, end_row]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RangeSpec {
    pub start_row: String,
    pub end_row: String,
}

impl RangeSpec {
    pub fn new(start_row: impl Into<String>, end_row: impl Into<String>) -> Self {
        Self {
            start_row: start_row.into(),
            end_row: end_row.into(),
        }
    }

    /// Whether `row` lies inside `(start_row, end_row]`.
    pub fn contains(&self, row: &str) -> bool {
        self.start_row.as_str() < row && row <= self.end_row.as_str()
    }
}

/// A range qualified by its table.
///
/// Equality and ordering ignore the table generation: a range's identity is
/// its table id and boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualifiedRangeSpec {
    pub table: TableIdentifier,
    pub range: RangeSpec,
}

impl QualifiedRangeSpec {
    pub fn new(table: TableIdentifier, range: RangeSpec) -> Self {
        Self { table, range }
    }

    /// Whether this is the root range.
    pub fn is_root(&self) -> bool {
        self.table.is_metadata() && self.range.end_row == END_ROOT_ROW
    }

    /// Commit-log class the range belongs to.
    pub fn class(&self) -> TableClass {
        if self.table.is_metadata() {
            if self.is_root() {
                TableClass::Root
            } else {
                TableClass::Metadata
            }
        } else if self.table.is_system() {
            TableClass::System
        } else {
            TableClass::User
        }
    }

    /// Human-readable name, e.g. `2[a..m]`.
    pub fn name(&self) -> String {
        self.to_string()
    }

    fn identity(&self) -> (&str, &str, &str) {
        (&self.table.id, &self.range.start_row, &self.range.end_row)
    }
}

impl PartialEq for QualifiedRangeSpec {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for QualifiedRangeSpec {}

impl std::hash::Hash for QualifiedRangeSpec {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl PartialOrd for QualifiedRangeSpec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QualifiedRangeSpec {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl fmt::Display for QualifiedRangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}..{}]",
            self.table.id,
            self.range.start_row,
            if self.range.end_row == END_ROW_MARKER {
                "<end>"
            } else {
                self.range.end_row.as_str()
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_order_is_replay_order() {
        let mut classes = vec![
            TableClass::User,
            TableClass::Root,
            TableClass::System,
            TableClass::Metadata,
        ];
        classes.sort();
        assert_eq!(classes, TableClass::ALL.to_vec());
    }

    #[test]
    fn test_range_contains_is_start_exclusive() {
        let spec = RangeSpec::new("b", "m");
        assert!(!spec.contains("b"));
        assert!(spec.contains("c"));
        assert!(spec.contains("m"));
        assert!(!spec.contains("n"));
    }

    #[test]
    fn test_classification() {
        let root = QualifiedRangeSpec::new(TableIdentifier::metadata(), RangeSpec::new("", END_ROOT_ROW));
        assert_eq!(root.class(), TableClass::Root);

        let meta = QualifiedRangeSpec::new(
            TableIdentifier::metadata(),
            RangeSpec::new(END_ROOT_ROW, END_ROW_MARKER),
        );
        assert_eq!(meta.class(), TableClass::Metadata);

        let sys = QualifiedRangeSpec::new(TableIdentifier::new("0/1", 1), RangeSpec::new("", END_ROW_MARKER));
        assert_eq!(sys.class(), TableClass::System);

        let user = QualifiedRangeSpec::new(TableIdentifier::new("3", 1), RangeSpec::new("", END_ROW_MARKER));
        assert_eq!(user.class(), TableClass::User);
    }

    #[test]
    fn test_identity_ignores_generation() {
        let a = QualifiedRangeSpec::new(TableIdentifier::new("3", 1), RangeSpec::new("", "m"));
        let b = QualifiedRangeSpec::new(TableIdentifier::new("3", 7), RangeSpec::new("", "m"));
        assert_eq!(a, b);
    }
}
