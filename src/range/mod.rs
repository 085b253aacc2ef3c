//! Ranges and the node's range directory

mod catalog;
mod live_map;
mod maintenance;
#[allow(clippy::module_inception)]
mod range;
mod spec;
mod state;

pub use catalog::{PermissiveCatalog, StaticCatalog, TableCatalog};
pub use live_map::{verify_partition, LiveRangeTable, PartitionIssue, TableInfo};
pub use maintenance::{MaintenanceQueue, MaintenanceTask};
pub use range::Range;
pub use spec::{
    QualifiedRangeSpec, RangeSpec, TableClass, TableIdentifier, END_ROOT_ROW, END_ROW_MARKER,
    METADATA_TABLE_ID,
};
pub use state::{is_phantom_log_path, RangeFlags, RangeState, RangeStateKind, PHANTOM_LOG_SEGMENT};
