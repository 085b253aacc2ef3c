//! Master callbacks
//!
//! Long-running phases answer the master out of band: prepare and commit
//! report per-range results once done, replay reports liveness while it
//! scans and its outcome at the end. Transport is not part of this crate.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::range::{QualifiedRangeSpec, TableClass};

use super::errors::{FailoverError, FailoverResult};

/// Per-range results of one prepare or commit call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub op_id: i64,
    /// Failed node whose ranges are being taken over
    pub location: String,
    pub generation: i64,
    pub results: BTreeMap<QualifiedRangeSpec, Result<(), FailoverError>>,
}

impl PhaseReport {
    pub fn new(op_id: i64, location: impl Into<String>, generation: i64) -> Self {
        Self {
            op_id,
            location: location.into(),
            generation,
            results: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, spec: QualifiedRangeSpec, result: Result<(), FailoverError>) {
        self.results.insert(spec, result);
    }

    pub fn succeed_all(&mut self, specs: &[QualifiedRangeSpec]) {
        for spec in specs {
            self.record(spec.clone(), Ok(()));
        }
    }

    pub fn fail_all(&mut self, specs: &[QualifiedRangeSpec], err: &FailoverError) {
        for spec in specs {
            self.record(spec.clone(), Err(err.clone()));
        }
    }

    pub fn is_success(&self) -> bool {
        self.results.values().all(Result::is_ok)
    }

    pub fn first_error(&self) -> Option<&FailoverError> {
        self.results.values().find_map(|r| r.as_ref().err())
    }

    pub fn failed_ranges(&self) -> Vec<QualifiedRangeSpec> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(spec, _)| spec.clone())
            .collect()
    }

    /// The report as a single result: the first error, if any.
    pub fn into_result(self) -> FailoverResult<()> {
        match self.first_error() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Periodic liveness report of a running replay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayProgress {
    pub blocks_read: u64,
    pub pairs_sent: u64,
    pub pairs_skipped: u64,
    pub current_fragment: Option<u32>,
}

/// What a finished replay delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayOutcome {
    pub blocks_read: u64,
    pub pairs_sent: u64,
    /// Pairs no plan entry covers
    pub pairs_skipped: u64,
    pub batches_sent: u64,
    /// Batches the destination had already processed
    pub batches_duplicate: u64,
    pub skipped_fragments: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub op_id: i64,
    pub location: String,
    pub generation: i64,
    pub class: TableClass,
    pub fragments: Vec<u32>,
    pub result: Result<ReplayOutcome, FailoverError>,
}

pub trait MasterClient: Send + Sync {
    fn replay_status(
        &self,
        op_id: i64,
        location: &str,
        generation: i64,
        progress: &ReplayProgress,
    ) -> FailoverResult<()>;

    fn replay_complete(&self, report: &ReplayReport) -> FailoverResult<()>;

    fn phantom_prepare_complete(&self, report: &PhaseReport) -> FailoverResult<()>;

    fn phantom_commit_complete(&self, report: &PhaseReport) -> FailoverResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::{RangeSpec, TableIdentifier};

    fn spec(end: &str) -> QualifiedRangeSpec {
        QualifiedRangeSpec::new(TableIdentifier::new("7", 1), RangeSpec::new("", end))
    }

    #[test]
    fn test_one_failure_does_not_hide_others() {
        let mut report = PhaseReport::new(9, "rs1", 2);
        report.record(spec("a"), Ok(()));
        report.record(
            spec("b"),
            Err(FailoverError::PhantomRangeNotFound {
                location: "rs1".into(),
                range: spec("b").name(),
            }),
        );
        assert!(!report.is_success());
        assert_eq!(report.failed_ranges(), vec![spec("b")]);
        assert_eq!(report.results.len(), 2);
        assert!(report.into_result().is_err());
    }
}
