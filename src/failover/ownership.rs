//! Ownership handoff
//!
//! The root range's owner is an attribute on the coordination service's
//! root node. Every other range's owner is the Location cell of its row in
//! the metadata table, keyed `<table_id>:<end_row>`.

use std::sync::Arc;

use crate::range::QualifiedRangeSpec;

use super::errors::{FailoverError, FailoverResult};

pub const LOCATION_ATTR: &str = "Location";
pub const LOCATION_COLUMN: &str = "Location";

pub trait CoordinationService: Send + Sync {
    fn attr_set(&self, path: &str, attr: &str, value: &str) -> FailoverResult<()>;
}

pub trait MetadataTable: Send + Sync {
    fn set_cell(&self, row: &str, column: &str, value: &str) -> FailoverResult<()>;

    fn flush(&self) -> FailoverResult<()>;
}

/// Metadata row describing `spec`.
pub fn metadata_row(spec: &QualifiedRangeSpec) -> String {
    format!("{}:{}", spec.table.id, spec.range.end_row)
}

pub struct OwnershipWriter {
    coordination: Arc<dyn CoordinationService>,
    metadata: Arc<dyn MetadataTable>,
    root_path: String,
}

impl OwnershipWriter {
    pub fn new(
        coordination: Arc<dyn CoordinationService>,
        metadata: Arc<dyn MetadataTable>,
        toplevel: &str,
    ) -> Self {
        Self {
            coordination,
            metadata,
            root_path: format!("{}/root", toplevel.trim_end_matches('/')),
        }
    }

    /// Records `location` as the owner of `spec`.
    pub fn take_ownership(&self, spec: &QualifiedRangeSpec, location: &str) -> FailoverResult<()> {
        let result = if spec.is_root() {
            self.coordination
                .attr_set(&self.root_path, LOCATION_ATTR, location)
        } else {
            self.metadata
                .set_cell(&metadata_row(spec), LOCATION_COLUMN, location)
                .and_then(|_| self.metadata.flush())
        };
        result.map_err(|e| match e {
            e @ FailoverError::Ownership { .. } => e,
            other => FailoverError::Ownership {
                range: spec.name(),
                reason: other.to_string(),
            },
        })
    }
}

impl std::fmt::Debug for OwnershipWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnershipWriter")
            .field("root_path", &self.root_path)
            .finish()
    }
}
