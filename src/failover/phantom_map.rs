//! Per-failed-node staging map
//!
//! One `PhantomRangeMap` exists per failed node this node is receiving
//! ranges from. Its mutex serializes every phase for that node, so prepare
//! and commit hold it across their log, metalog and ownership writes. The
//! live range table may be locked while it is held, never the reverse.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::observability::{Event, Logger};
use crate::range::QualifiedRangeSpec;

use super::phantom::PhantomRange;

/// How a request's plan generation compares to the staged one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationCheck {
    /// Older plan, the request is ignored
    Stale,
    Current,
    /// Newer plan, the staged state was discarded
    Newer,
}

#[derive(Debug)]
pub struct PhantomMapState {
    generation: i64,
    loaded: bool,
    prepared: bool,
    ranges: BTreeMap<QualifiedRangeSpec, PhantomRange>,
}

impl PhantomMapState {
    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn set_loaded(&mut self) {
        self.loaded = true;
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn set_prepared(&mut self) {
        self.prepared = true;
    }

    /// Drops every staged range and adopts `generation`.
    pub fn reset(&mut self, generation: i64) {
        self.generation = generation;
        self.loaded = false;
        self.prepared = false;
        self.ranges.clear();
    }

    pub fn insert(&mut self, range: PhantomRange) -> bool {
        if self.ranges.contains_key(range.spec()) {
            return false;
        }
        self.ranges.insert(range.spec().clone(), range);
        true
    }

    pub fn get(&self, spec: &QualifiedRangeSpec) -> Option<&PhantomRange> {
        self.ranges.get(spec)
    }

    pub fn get_mut(&mut self, spec: &QualifiedRangeSpec) -> Option<&mut PhantomRange> {
        self.ranges.get_mut(spec)
    }

    pub fn ranges(&self) -> impl Iterator<Item = &PhantomRange> {
        self.ranges.values()
    }

    pub fn specs(&self) -> Vec<QualifiedRangeSpec> {
        self.ranges.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[derive(Debug)]
pub struct PhantomRangeMap {
    location: String,
    state: Mutex<PhantomMapState>,
}

impl PhantomRangeMap {
    pub fn new(location: impl Into<String>, generation: i64) -> Self {
        Self {
            location: location.into(),
            state: Mutex::new(PhantomMapState {
                generation,
                loaded: false,
                prepared: false,
                ranges: BTreeMap::new(),
            }),
        }
    }

    /// Failed node this map stages ranges for.
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn generation(&self) -> i64 {
        self.lock().generation
    }

    pub fn lock(&self) -> MutexGuard<'_, PhantomMapState> {
        self.state.lock().unwrap()
    }

    /// Compares `generation` with the staged plan, resetting the map when
    /// the request carries a newer one.
    pub fn check_generation(&self, state: &mut PhantomMapState, generation: i64) -> GenerationCheck {
        if generation < state.generation {
            GenerationCheck::Stale
        } else if generation == state.generation {
            GenerationCheck::Current
        } else {
            Logger::event_owned(
                Event::PhantomMapReset,
                &[
                    ("location", self.location.clone()),
                    ("generation", generation.to_string()),
                    ("previous_generation", state.generation.to_string()),
                    ("ranges_dropped", state.len().to_string()),
                ],
            );
            state.reset(generation);
            GenerationCheck::Newer
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::{RangeSpec, RangeState, TableIdentifier};

    fn phantom(end: &str) -> PhantomRange {
        let spec = QualifiedRangeSpec::new(TableIdentifier::new("7", 1), RangeSpec::new("", end));
        PhantomRange::new(spec, RangeState::steady(), &[0])
    }

    #[test]
    fn test_generation_check() {
        let map = PhantomRangeMap::new("rs1", 5);
        let mut state = map.lock();
        assert_eq!(map.check_generation(&mut state, 4), GenerationCheck::Stale);
        assert_eq!(map.check_generation(&mut state, 5), GenerationCheck::Current);
    }

    #[test]
    fn test_newer_generation_resets() {
        let map = PhantomRangeMap::new("rs1", 1);
        {
            let mut state = map.lock();
            assert!(state.insert(phantom("m")));
            assert!(!state.insert(phantom("m")));
            state.set_loaded();
            assert_eq!(map.check_generation(&mut state, 2), GenerationCheck::Newer);
            assert!(state.is_empty());
            assert!(!state.is_loaded());
        }
        assert_eq!(map.generation(), 2);
    }
}
