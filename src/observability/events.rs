//! Lifecycle events of recovery and failover
//!
//! Events are explicit and typed. Free-form events logged directly through
//! `Logger` are reserved for low-level storage diagnostics.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Node lifecycle
    /// Node context built, recovery about to start
    NodeStart,
    /// Shutdown initiated
    ShutdownStart,
    /// All logs closed
    ShutdownComplete,
    /// Configuration loaded
    ConfigLoaded,

    // Local recovery
    /// Local recovery started
    RecoveryStart,
    /// Every class replayed, all gates open
    RecoveryComplete,
    /// Local recovery failed (FATAL)
    RecoveryFailed,
    /// Never-adopted phantom entity removed from the metalog
    PhantomEntityStripped,
    /// Range entity of a table the catalog no longer knows
    TableSkipped,
    /// Range entity upgraded to the catalog's newer generation
    TableGenerationUpgraded,
    /// A class barrier gate opened
    BarrierOpened,
    /// Finishing task enqueued for an interrupted split or relinquish
    MaintenanceScheduled,
    /// Row-space partition check found a gap or overlap
    PartitionIssue,
    /// Metalog damaged beyond a torn tail (FATAL)
    MetalogCorruption,
    /// Commit-log fragment damaged and skip mode off (FATAL)
    CommitLogCorruption,

    // Failover
    /// Ranges staged by `phantom_load`
    PhantomLoaded,
    /// Request carried an older plan generation and was ignored
    StaleRequestIgnored,
    /// Newer plan generation discarded staged state
    PhantomMapReset,
    /// Batch for a fragment that was already fully received
    FragmentAlreadyProcessed,
    /// One phantom range prepared
    PhantomRangePrepared,
    /// One phantom range failed to prepare or commit
    PhantomRangeFailed,
    /// Commit found every range already live
    PhantomCommitNoop,
    /// Ranges merged into the live table
    PhantomCommitted,
    /// Liveness report sent during fragment replay
    ReplayStatus,
    /// Fragment replay aborted
    ReplayAborted,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::NodeStart => "NODE_START",
            Event::ShutdownStart => "SHUTDOWN_START",
            Event::ShutdownComplete => "SHUTDOWN_COMPLETE",
            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::RecoveryStart => "LOCAL_RECOVERY_BEGIN",
            Event::RecoveryComplete => "LOCAL_RECOVERY_COMPLETE",
            Event::RecoveryFailed => "LOCAL_RECOVERY_FAILED",
            Event::PhantomEntityStripped => "PHANTOM_ENTITY_STRIPPED",
            Event::TableSkipped => "RECOVERY_TABLE_SKIPPED",
            Event::TableGenerationUpgraded => "RECOVERY_TABLE_GENERATION_UPGRADED",
            Event::BarrierOpened => "REPLAY_BARRIER_OPENED",
            Event::MaintenanceScheduled => "MAINTENANCE_TASK_SCHEDULED",
            Event::PartitionIssue => "PARTITION_ISSUE",
            Event::MetalogCorruption => "METALOG_CORRUPTION",
            Event::CommitLogCorruption => "COMMITLOG_CORRUPTION",

            Event::PhantomLoaded => "PHANTOM_LOAD_COMPLETE",
            Event::StaleRequestIgnored => "STALE_REQUEST_IGNORED",
            Event::PhantomMapReset => "PHANTOM_MAP_RESET",
            Event::FragmentAlreadyProcessed => "FRAGMENT_ALREADY_PROCESSED",
            Event::PhantomRangePrepared => "PHANTOM_RANGE_PREPARED",
            Event::PhantomRangeFailed => "PHANTOM_RANGE_FAILED",
            Event::PhantomCommitNoop => "PHANTOM_COMMIT_NOOP",
            Event::PhantomCommitted => "PHANTOM_COMMITTED",
            Event::ReplayStatus => "REPLAY_STATUS",
            Event::ReplayAborted => "REPLAY_ABORTED",
        }
    }

    /// Returns true if this event indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Event::RecoveryFailed | Event::MetalogCorruption | Event::CommitLogCorruption
        )
    }

    /// Returns true if this event should be logged at WARN
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Event::TableSkipped
                | Event::PartitionIssue
                | Event::PhantomMapReset
                | Event::PhantomRangeFailed
                | Event::ReplayAborted
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_events_have_string_representation() {
        let events = [
            Event::NodeStart,
            Event::ShutdownStart,
            Event::ShutdownComplete,
            Event::ConfigLoaded,
            Event::RecoveryStart,
            Event::RecoveryComplete,
            Event::RecoveryFailed,
            Event::PhantomEntityStripped,
            Event::TableSkipped,
            Event::TableGenerationUpgraded,
            Event::BarrierOpened,
            Event::MaintenanceScheduled,
            Event::PartitionIssue,
            Event::MetalogCorruption,
            Event::CommitLogCorruption,
            Event::PhantomLoaded,
            Event::StaleRequestIgnored,
            Event::PhantomMapReset,
            Event::FragmentAlreadyProcessed,
            Event::PhantomRangePrepared,
            Event::PhantomRangeFailed,
            Event::PhantomCommitNoop,
            Event::PhantomCommitted,
            Event::ReplayStatus,
            Event::ReplayAborted,
        ];

        for event in events {
            let s = event.as_str();
            assert!(!s.is_empty());
            assert!(s.chars().all(|c| c.is_uppercase() || c == '_'));
            assert!(!(event.is_fatal() && event.is_warning()));
        }
    }

    #[test]
    fn test_fatal_events() {
        assert!(Event::MetalogCorruption.is_fatal());
        assert!(Event::RecoveryFailed.is_fatal());
        assert!(!Event::StaleRequestIgnored.is_fatal());
        assert!(!Event::PhantomCommitted.is_fatal());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(format!("{}", Event::BarrierOpened), "REPLAY_BARRIER_OPENED");
    }
}
