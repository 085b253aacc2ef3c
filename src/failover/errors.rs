//! Failover error types
//!
//! Errors travel back to the master in phase reports and to replaying peers
//! in `phantom_update` responses, so every variant is `Clone` and carries
//! only owned strings.
//!
//! A stale plan generation is not an error: stale requests succeed as
//! no-ops and never reach this type.

use thiserror::Error;

use crate::commitlog::CommitLogError;
use crate::metalog::MetaLogError;
use crate::recovery::RecoveryError;

pub type FailoverResult<T> = Result<T, FailoverError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailoverError {
    /// A barrier wait or a replay ran past its deadline
    #[error("timed out: {what}")]
    Timeout { what: String },

    #[error("no phantom range map for failed node {location}")]
    PhantomRangeMapNotFound { location: String },

    #[error("phantom range {range} of failed node {location} not staged")]
    PhantomRangeNotFound { location: String, range: String },

    /// The request belongs to a different recovery plan than the one staged
    #[error("plan generation mismatch for {location}: staged {staged}, request {requested}")]
    PlanGenerationMismatch {
        location: String,
        staged: i64,
        requested: i64,
    },

    #[error("fragment {fragment_id} is not expected by phantom range {range}")]
    FragmentNotExpected { range: String, fragment_id: u32 },

    #[error("phantom range {range} still waiting for fragments {missing:?}")]
    FragmentsIncomplete { range: String, missing: Vec<u32> },

    /// A phase was requested before the range reached the state it needs
    #[error("phantom range {range} is {state}, cannot {phase}")]
    PhaseOutOfOrder {
        range: String,
        state: &'static str,
        phase: &'static str,
    },

    #[error("invalid phantom range transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("corrupt commit-log fragment {fragment_id}: {reason}")]
    CorruptFragment { fragment_id: u32, reason: String },

    #[error("table {table} not found")]
    TableNotFound { table: String },

    #[error("commit log failure: {0}")]
    CommitLog(String),

    #[error("metalog failure: {0}")]
    MetaLog(String),

    /// Delivery to a peer failed
    #[error("transport failure to {destination}: {reason}")]
    Transport { destination: String, reason: String },

    /// Writing the new owner to the coordination service or metadata table failed
    #[error("could not take ownership of {range}: {reason}")]
    Ownership { range: String, reason: String },

    #[error("replay aborted: {reason}")]
    ReplayAborted { reason: String },
}

impl FailoverError {
    pub fn forbidden_transition(from: &'static str, to: &'static str) -> Self {
        FailoverError::InvalidTransition { from, to }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FailoverError::Timeout { .. } => "RK_FAILOVER_TIMEOUT",
            FailoverError::PhantomRangeMapNotFound { .. } => "RK_FAILOVER_PHANTOM_RANGE_MAP_NOT_FOUND",
            FailoverError::PhantomRangeNotFound { .. } => "RK_FAILOVER_PHANTOM_RANGE_NOT_FOUND",
            FailoverError::PlanGenerationMismatch { .. } => "RK_FAILOVER_PLAN_GENERATION_MISMATCH",
            FailoverError::FragmentNotExpected { .. } => "RK_FAILOVER_FRAGMENT_NOT_EXPECTED",
            FailoverError::FragmentsIncomplete { .. } => "RK_FAILOVER_FRAGMENTS_INCOMPLETE",
            FailoverError::PhaseOutOfOrder { .. } => "RK_FAILOVER_PHASE_OUT_OF_ORDER",
            FailoverError::InvalidTransition { .. } => "RK_FAILOVER_INVALID_TRANSITION",
            FailoverError::InvalidRequest(_) => "RK_FAILOVER_INVALID_REQUEST",
            FailoverError::CorruptFragment { .. } => "RK_FAILOVER_CORRUPT_FRAGMENT",
            FailoverError::TableNotFound { .. } => "RK_FAILOVER_TABLE_NOT_FOUND",
            FailoverError::CommitLog(_) => "RK_FAILOVER_COMMITLOG",
            FailoverError::MetaLog(_) => "RK_FAILOVER_METALOG",
            FailoverError::Transport { .. } => "RK_FAILOVER_TRANSPORT",
            FailoverError::Ownership { .. } => "RK_FAILOVER_OWNERSHIP",
            FailoverError::ReplayAborted { .. } => "RK_FAILOVER_REPLAY_ABORTED",
        }
    }

    /// The failed node's log is unreadable or this node's metalog failed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FailoverError::CorruptFragment { .. } | FailoverError::MetaLog(_)
        )
    }

    /// Transient failures a delivery may retry. Everything else is
    /// returned to the master, which retries the whole phase.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailoverError::Transport { .. } | FailoverError::Timeout { .. }
        )
    }
}

impl From<RecoveryError> for FailoverError {
    fn from(err: RecoveryError) -> Self {
        match err {
            RecoveryError::Timeout { class } => FailoverError::Timeout {
                what: format!("{} log replay", class),
            },
            RecoveryError::CorruptFragment {
                fragment_id,
                reason,
                ..
            } => FailoverError::CorruptFragment {
                fragment_id,
                reason,
            },
            RecoveryError::TableNotFound { table } => FailoverError::TableNotFound { table },
            RecoveryError::MetaLog(e) => FailoverError::MetaLog(e.to_string()),
            other @ (RecoveryError::CommitLog(_) | RecoveryError::Io { .. }) => {
                FailoverError::CommitLog(other.to_string())
            }
        }
    }
}

impl From<CommitLogError> for FailoverError {
    fn from(err: CommitLogError) -> Self {
        RecoveryError::from(err).into()
    }
}

impl From<MetaLogError> for FailoverError {
    fn from(err: MetaLogError) -> Self {
        FailoverError::MetaLog(err.to_string())
    }
}
