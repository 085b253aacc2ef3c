use std::collections::HashMap;

/// Source of truth for which tables exist and their schema generation.
pub trait TableCatalog: Send + Sync {
    /// Current generation of `table_id`, or `None` if the table is unknown.
    fn generation(&self, table_id: &str) -> Option<i64>;
}

/// Catalog that knows every table and never reports a newer generation.
#[derive(Debug, Default, Clone)]
pub struct PermissiveCatalog;

impl TableCatalog for PermissiveCatalog {
    fn generation(&self, _table_id: &str) -> Option<i64> {
        Some(0)
    }
}

/// Fixed table list.
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    tables: HashMap<String, i64>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table_id: impl Into<String>, generation: i64) -> Self {
        self.tables.insert(table_id.into(), generation);
        self
    }
}

impl TableCatalog for StaticCatalog {
    fn generation(&self, table_id: &str) -> Option<i64> {
        self.tables.get(table_id).copied()
    }
}
