//! Phantom range state machine
//!
//! A phantom range is a range of a failed node staged on this node while
//! the failed node's log is redistributed. Its state only moves forward:
//!
//! ```text
//! Created -> Loaded -> Populated -> Prepared -> Committed
//! ```
//!
//! Crash semantics:
//! - Created, Loaded, Populated: nothing durable, the staging is forgotten
//! - Prepared: entity persisted with PHANTOM set, stripped on restart
//! - Committed: entity persisted without PHANTOM, the range is owned

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::commitlog::KeyValue;
use crate::range::{QualifiedRangeSpec, Range, RangeState};

use super::errors::{FailoverError, FailoverResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PhantomState {
    /// Known to the staging map, nothing recorded yet
    Created,
    /// Expected fragments recorded, receiving replayed batches
    Loaded,
    /// Range object and transfer log materialized from the batches
    Populated,
    /// Transfer log linked into this node's class log, entity persisted
    Prepared,
    /// Ownership taken and range merged into the live table
    Committed,
}

impl PhantomState {
    pub fn state_name(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Loaded => "Loaded",
            Self::Populated => "Populated",
            Self::Prepared => "Prepared",
            Self::Committed => "Committed",
        }
    }

    /// Created → Loaded
    pub fn load(self) -> FailoverResult<Self> {
        match self {
            Self::Created => Ok(Self::Loaded),
            _ => Err(FailoverError::forbidden_transition(
                self.state_name(),
                "Loaded",
            )),
        }
    }

    /// Loaded → Populated
    pub fn populate(self) -> FailoverResult<Self> {
        match self {
            Self::Loaded => Ok(Self::Populated),
            _ => Err(FailoverError::forbidden_transition(
                self.state_name(),
                "Populated",
            )),
        }
    }

    /// Populated → Prepared
    pub fn prepare(self) -> FailoverResult<Self> {
        match self {
            Self::Populated => Ok(Self::Prepared),
            _ => Err(FailoverError::forbidden_transition(
                self.state_name(),
                "Prepared",
            )),
        }
    }

    /// Prepared → Committed
    pub fn commit(self) -> FailoverResult<Self> {
        match self {
            Self::Prepared => Ok(Self::Committed),
            _ => Err(FailoverError::forbidden_transition(
                self.state_name(),
                "Committed",
            )),
        }
    }
}

/// One staged range and the batches replayed into it.
#[derive(Debug)]
pub struct PhantomRange {
    spec: QualifiedRangeSpec,
    range_state: RangeState,
    state: PhantomState,
    expected_fragments: BTreeSet<u32>,
    completed_fragments: BTreeSet<u32>,
    buffered: Vec<KeyValue>,
    range: Option<Arc<Range>>,
    transfer_log: Option<PathBuf>,
}

impl PhantomRange {
    /// Stages `spec`, expecting one complete delivery from each of `fragments`.
    pub fn new(spec: QualifiedRangeSpec, range_state: RangeState, fragments: &[u32]) -> Self {
        Self {
            spec,
            range_state,
            state: PhantomState::Created,
            expected_fragments: fragments.iter().copied().collect(),
            completed_fragments: BTreeSet::new(),
            buffered: Vec::new(),
            range: None,
            transfer_log: None,
        }
    }

    pub fn spec(&self) -> &QualifiedRangeSpec {
        &self.spec
    }

    /// State the failed node persisted for the range.
    pub fn range_state(&self) -> &RangeState {
        &self.range_state
    }

    pub fn state(&self) -> PhantomState {
        self.state
    }

    pub fn range(&self) -> Option<Arc<Range>> {
        self.range.clone()
    }

    pub fn transfer_log(&self) -> Option<&Path> {
        self.transfer_log.as_deref()
    }

    pub fn buffered_pairs(&self) -> &[KeyValue] {
        &self.buffered
    }

    pub fn load(&mut self) -> FailoverResult<()> {
        self.state = self.state.load()?;
        Ok(())
    }

    /// Buffers one replayed batch.
    ///
    /// Returns `Ok(false)` when the batch was already processed: its
    /// fragment is complete or the range has moved past receiving. A batch
    /// with `more == false` completes its fragment.
    pub fn add(&mut self, fragment_id: u32, pairs: Vec<KeyValue>, more: bool) -> FailoverResult<bool> {
        if self.state >= PhantomState::Populated || self.completed_fragments.contains(&fragment_id) {
            return Ok(false);
        }
        if self.state != PhantomState::Loaded {
            return Err(FailoverError::PhaseOutOfOrder {
                range: self.spec.name(),
                state: self.state.state_name(),
                phase: "update",
            });
        }
        if !self.expected_fragments.contains(&fragment_id) {
            return Err(FailoverError::FragmentNotExpected {
                range: self.spec.name(),
                fragment_id,
            });
        }
        self.buffered.extend(pairs);
        if !more {
            self.completed_fragments.insert(fragment_id);
        }
        Ok(true)
    }

    pub fn missing_fragments(&self) -> Vec<u32> {
        self.expected_fragments
            .difference(&self.completed_fragments)
            .copied()
            .collect()
    }

    pub fn all_fragments_received(&self) -> bool {
        self.expected_fragments.is_subset(&self.completed_fragments)
    }

    /// Loaded → Populated. Hands over the materialized range and the
    /// transfer log it was written to and drops the buffered batches.
    pub fn set_populated(&mut self, range: Arc<Range>, transfer_log: PathBuf) -> FailoverResult<()> {
        if !self.all_fragments_received() {
            return Err(FailoverError::FragmentsIncomplete {
                range: self.spec.name(),
                missing: self.missing_fragments(),
            });
        }
        self.state = self.state.populate()?;
        self.range = Some(range);
        self.transfer_log = Some(transfer_log);
        self.buffered = Vec::new();
        Ok(())
    }

    pub fn set_prepared(&mut self) -> FailoverResult<()> {
        self.state = self.state.prepare()?;
        Ok(())
    }

    pub fn set_committed(&mut self) -> FailoverResult<()> {
        self.state = self.state.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metalog::RangeEntity;
    use crate::range::{RangeSpec, TableIdentifier};

    fn spec() -> QualifiedRangeSpec {
        QualifiedRangeSpec::new(TableIdentifier::new("7", 1), RangeSpec::new("f", "m"))
    }

    fn kv(row: &str) -> KeyValue {
        KeyValue::new(row, "cf", 1, 1, b"v".to_vec())
    }

    fn loaded(fragments: &[u32]) -> PhantomRange {
        let mut phantom = PhantomRange::new(spec(), RangeState::steady(), fragments);
        phantom.load().unwrap();
        phantom
    }

    fn materialized() -> Arc<Range> {
        Arc::new(Range::new(RangeEntity::new(1, spec(), RangeState::steady())))
    }

    #[test]
    fn test_states_only_move_forward() {
        let state = PhantomState::Created.load().unwrap();
        assert_eq!(state, PhantomState::Loaded);
        assert!(matches!(
            state.prepare(),
            Err(FailoverError::InvalidTransition {
                from: "Loaded",
                to: "Prepared"
            })
        ));
        assert!(PhantomState::Committed.load().is_err());
        assert!(PhantomState::Prepared > PhantomState::Populated);
    }

    #[test]
    fn test_final_batch_completes_fragment() {
        let mut phantom = loaded(&[3, 4]);
        assert!(phantom.add(3, vec![kv("g")], true).unwrap());
        assert!(phantom.add(3, vec![kv("h")], false).unwrap());
        assert_eq!(phantom.missing_fragments(), vec![4]);

        // Redelivery after a retry
        assert!(!phantom.add(3, vec![kv("h")], false).unwrap());
        assert_eq!(phantom.buffered_pairs().len(), 2);
    }

    #[test]
    fn test_unexpected_fragment_rejected() {
        let mut phantom = loaded(&[3]);
        let err = phantom.add(9, vec![kv("g")], false).unwrap_err();
        assert!(matches!(err, FailoverError::FragmentNotExpected { fragment_id: 9, .. }));
    }

    #[test]
    fn test_populate_needs_every_fragment() {
        let mut phantom = loaded(&[3, 4]);
        phantom.add(3, Vec::new(), false).unwrap();
        let err = phantom
            .set_populated(materialized(), PathBuf::from("/t"))
            .unwrap_err();
        assert_eq!(
            err,
            FailoverError::FragmentsIncomplete {
                range: spec().name(),
                missing: vec![4]
            }
        );

        phantom.add(4, vec![kv("k")], false).unwrap();
        phantom.set_populated(materialized(), PathBuf::from("/t")).unwrap();
        assert_eq!(phantom.state(), PhantomState::Populated);
        assert!(phantom.buffered_pairs().is_empty());
        assert!(!phantom.add(4, vec![kv("k")], false).unwrap());
    }

    #[test]
    fn test_update_before_load_is_out_of_order() {
        let mut phantom = PhantomRange::new(spec(), RangeState::steady(), &[1]);
        assert!(matches!(
            phantom.add(1, Vec::new(), false),
            Err(FailoverError::PhaseOutOfOrder { .. })
        ));
    }
}
