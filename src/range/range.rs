use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::commitlog::{Key, KeyValue};
use crate::metalog::RangeEntity;

use super::spec::QualifiedRangeSpec;

struct RangeInner {
    entity: RangeEntity,
    cells: BTreeMap<Key, Vec<u8>>,
    latest_revision: i64,
}

/// An owned range: its persisted entity plus the cells replayed into it.
///
/// Cells are keyed by their full key, so applying the same pair twice
/// leaves one copy.
pub struct Range {
    inner: Mutex<RangeInner>,
}

impl Range {
    pub fn new(entity: RangeEntity) -> Self {
        Self {
            inner: Mutex::new(RangeInner {
                entity,
                cells: BTreeMap::new(),
                latest_revision: 0,
            }),
        }
    }

    pub fn spec(&self) -> QualifiedRangeSpec {
        self.inner.lock().unwrap().entity.spec.clone()
    }

    pub fn name(&self) -> String {
        self.spec().name()
    }

    pub fn entity(&self) -> RangeEntity {
        self.inner.lock().unwrap().entity.clone()
    }

    /// Applies `f` to the entity and refreshes its timestamp.
    pub fn update_entity<F: FnOnce(&mut RangeEntity)>(&self, f: F) -> RangeEntity {
        let mut inner = self.inner.lock().unwrap();
        f(&mut inner.entity);
        inner.entity.touch();
        inner.entity.clone()
    }

    /// Applies `kv` if its row lies within the range's current boundaries.
    pub fn add(&self, kv: &KeyValue) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.entity.spec.range.contains(&kv.key.row) {
            return false;
        }
        inner.latest_revision = inner.latest_revision.max(kv.key.revision);
        inner.cells.insert(kv.key.clone(), kv.value.clone());
        true
    }

    pub fn cell_count(&self) -> usize {
        self.inner.lock().unwrap().cells.len()
    }

    pub fn cells(&self) -> Vec<KeyValue> {
        self.inner
            .lock()
            .unwrap()
            .cells
            .iter()
            .map(|(key, value)| KeyValue {
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }

    pub fn latest_revision(&self) -> i64 {
        self.inner.lock().unwrap().latest_revision
    }
}

impl std::fmt::Debug for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Range")
            .field("spec", &self.spec())
            .field("cells", &self.cell_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::{RangeSpec, RangeState, TableIdentifier};

    fn range(start: &str, end: &str) -> Range {
        Range::new(RangeEntity::new(
            1,
            QualifiedRangeSpec::new(TableIdentifier::new("3", 1), RangeSpec::new(start, end)),
            RangeState::steady(),
        ))
    }

    #[test]
    fn test_add_respects_boundaries() {
        let r = range("b", "m");
        assert!(r.add(&KeyValue::new("c", "cf", 0, 1, b"v".to_vec())));
        assert!(!r.add(&KeyValue::new("b", "cf", 0, 1, b"v".to_vec())));
        assert!(!r.add(&KeyValue::new("z", "cf", 0, 1, b"v".to_vec())));
        assert_eq!(r.cell_count(), 1);
    }

    #[test]
    fn test_same_pair_twice_is_one_cell() {
        let r = range("", "m");
        let kv = KeyValue::new("c", "cf", 5, 9, b"v".to_vec());
        r.add(&kv);
        r.add(&kv);
        assert_eq!(r.cell_count(), 1);
        assert_eq!(r.latest_revision(), 9);
    }

    #[test]
    fn test_update_entity() {
        let r = range("", "m");
        let updated = r.update_entity(|e| e.needs_compaction = true);
        assert!(updated.needs_compaction);
        assert!(r.entity().needs_compaction);
    }
}
