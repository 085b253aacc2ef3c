//! Maintenance work derived during recovery
//!
//! Ranges persisted mid-split or mid-relinquish need the operation
//! finished once the node is serving. The queue only records the work;
//! running it belongs to the maintenance scheduler.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::spec::QualifiedRangeSpec;
use super::state::RangeStateKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaintenanceTask {
    SplitFinish(QualifiedRangeSpec),
    RelinquishFinish(QualifiedRangeSpec),
}

impl MaintenanceTask {
    /// Task that finishes the operation `kind` left in flight, if any.
    pub fn for_state(kind: RangeStateKind, spec: &QualifiedRangeSpec) -> Option<Self> {
        if kind.is_splitting() {
            Some(MaintenanceTask::SplitFinish(spec.clone()))
        } else if kind.is_relinquishing() {
            Some(MaintenanceTask::RelinquishFinish(spec.clone()))
        } else {
            None
        }
    }

    pub fn spec(&self) -> &QualifiedRangeSpec {
        match self {
            MaintenanceTask::SplitFinish(spec) | MaintenanceTask::RelinquishFinish(spec) => spec,
        }
    }
}

impl fmt::Display for MaintenanceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaintenanceTask::SplitFinish(spec) => write!(f, "split-finish {}", spec),
            MaintenanceTask::RelinquishFinish(spec) => write!(f, "relinquish-finish {}", spec),
        }
    }
}

#[derive(Debug, Default)]
pub struct MaintenanceQueue {
    tasks: Mutex<VecDeque<MaintenanceTask>>,
    immediate_requests: AtomicU64,
}

impl MaintenanceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, task: MaintenanceTask) {
        self.tasks.lock().unwrap().push_back(task);
    }

    pub fn pending(&self) -> Vec<MaintenanceTask> {
        self.tasks.lock().unwrap().iter().cloned().collect()
    }

    pub fn drain(&self) -> Vec<MaintenanceTask> {
        self.tasks.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Asks the scheduler to run a maintenance pass now.
    pub fn schedule_immediate(&self) {
        self.immediate_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn immediate_requests(&self) -> u64 {
        self.immediate_requests.load(Ordering::Relaxed)
    }
}
