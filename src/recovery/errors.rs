//! Recovery error types
//!
//! Error codes:
//! - RK_RECOVERY_METALOG (FATAL)
//! - RK_RECOVERY_COMMITLOG (ERROR)
//! - RK_RECOVERY_CORRUPT_FRAGMENT (FATAL)
//! - RK_RECOVERY_TABLE_NOT_FOUND (FATAL for system tables)
//! - RK_RECOVERY_TIMEOUT (ERROR, caller retries)
//! - RK_RECOVERY_IO (ERROR)

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::commitlog::CommitLogError;
use crate::metalog::MetaLogError;
use crate::range::TableClass;

pub type RecoveryResult<T> = Result<T, RecoveryError>;

#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The node's own metalog could not be read or written
    #[error("metalog failure: {0}")]
    MetaLog(#[from] MetaLogError),

    #[error("commit log failure: {0}")]
    CommitLog(CommitLogError),

    #[error("corrupt commit-log fragment {fragment_id} ({path}): {reason}")]
    CorruptFragment {
        fragment_id: u32,
        path: PathBuf,
        reason: String,
    },

    /// A system table referenced by a range entity is unknown to the catalog
    #[error("table {table} not found")]
    TableNotFound { table: String },

    /// A barrier gate did not open before the deadline
    #[error("timed out waiting for {class} log replay")]
    Timeout { class: TableClass },

    #[error("I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<CommitLogError> for RecoveryError {
    fn from(err: CommitLogError) -> Self {
        match err {
            CommitLogError::CorruptFragment {
                fragment_id,
                path,
                reason,
            } => RecoveryError::CorruptFragment {
                fragment_id,
                path,
                reason,
            },
            other => RecoveryError::CommitLog(other),
        }
    }
}

impl RecoveryError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        RecoveryError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RecoveryError::MetaLog(_) => "RK_RECOVERY_METALOG",
            RecoveryError::CommitLog(_) => "RK_RECOVERY_COMMITLOG",
            RecoveryError::CorruptFragment { .. } => "RK_RECOVERY_CORRUPT_FRAGMENT",
            RecoveryError::TableNotFound { .. } => "RK_RECOVERY_TABLE_NOT_FOUND",
            RecoveryError::Timeout { .. } => "RK_RECOVERY_TIMEOUT",
            RecoveryError::Io { .. } => "RK_RECOVERY_IO",
        }
    }

    /// Fatal errors abort node startup; the rest fail a single request.
    pub fn is_fatal(&self) -> bool {
        match self {
            RecoveryError::MetaLog(e) => e.is_fatal(),
            RecoveryError::CorruptFragment { .. } | RecoveryError::TableNotFound { .. } => true,
            RecoveryError::CommitLog(_) | RecoveryError::Timeout { .. } | RecoveryError::Io { .. } => {
                false
            }
        }
    }

    pub fn fragment_id(&self) -> Option<u32> {
        match self {
            RecoveryError::CorruptFragment { fragment_id, .. } => Some(*fragment_id),
            _ => None,
        }
    }
}
