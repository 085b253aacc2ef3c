//! Commit-log error types
//!
//! Error codes:
//! - RK_COMMITLOG_IO (ERROR severity)
//! - RK_COMMITLOG_CODEC (ERROR severity, surfaced as corruption by readers)
//! - RK_COMMITLOG_CORRUPT_FRAGMENT (FATAL unless corrupt fragments are skipped)
//! - RK_COMMITLOG_FRAGMENT_MISSING (ERROR severity)
//! - RK_COMMITLOG_CLOSED (ERROR severity)

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for commit-log operations
pub type CommitLogResult<T> = Result<T, CommitLogError>;

#[derive(Debug, Error)]
pub enum CommitLogError {
    /// Filesystem operation failed
    #[error("commit log I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Bytes could not be decoded
    #[error("malformed commit-log data: {reason}")]
    Codec { reason: String },

    /// A fragment failed checksum or structure validation
    #[error("corrupt commit-log fragment {fragment_id} ({path}): {reason}")]
    CorruptFragment {
        fragment_id: u32,
        path: PathBuf,
        reason: String,
    },

    /// A fragment named by the caller does not exist
    #[error("commit-log fragment {fragment_id} not found in {dir}")]
    FragmentMissing { fragment_id: u32, dir: PathBuf },

    /// Write attempted after close
    #[error("commit log {dir} is closed")]
    Closed { dir: PathBuf },
}

impl CommitLogError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CommitLogError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn codec(reason: impl Into<String>) -> Self {
        CommitLogError::Codec {
            reason: reason.into(),
        }
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            CommitLogError::Io { .. } => "RK_COMMITLOG_IO",
            CommitLogError::Codec { .. } => "RK_COMMITLOG_CODEC",
            CommitLogError::CorruptFragment { .. } => "RK_COMMITLOG_CORRUPT_FRAGMENT",
            CommitLogError::FragmentMissing { .. } => "RK_COMMITLOG_FRAGMENT_MISSING",
            CommitLogError::Closed { .. } => "RK_COMMITLOG_CLOSED",
        }
    }

    /// Corruption halts replay unless the node is configured to skip it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CommitLogError::CorruptFragment { .. })
    }

    /// Fragment id for corruption errors.
    pub fn fragment_id(&self) -> Option<u32> {
        match self {
            CommitLogError::CorruptFragment { fragment_id, .. }
            | CommitLogError::FragmentMissing { fragment_id, .. } => Some(*fragment_id),
            _ => None,
        }
    }
}
