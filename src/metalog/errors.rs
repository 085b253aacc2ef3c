//! Metalog error types
//!
//! A node cannot safely guess its own range ownership, so every read-side
//! metalog failure is fatal to local recovery.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type MetaLogResult<T> = Result<T, MetaLogError>;

#[derive(Debug, Error)]
pub enum MetaLogError {
    #[error("metalog I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A complete record failed validation
    #[error("metalog corruption in {path} at offset {offset}: {reason}")]
    Corruption {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    /// An entity body could not be encoded
    #[error("metalog entity encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("metalog is closed")]
    Closed,
}

impl MetaLogError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        MetaLogError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corruption(path: impl Into<PathBuf>, offset: u64, reason: impl Into<String>) -> Self {
        MetaLogError::Corruption {
            path: path.into(),
            offset,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            MetaLogError::Io { .. } => "RK_METALOG_IO",
            MetaLogError::Corruption { .. } => "RK_METALOG_CORRUPTION",
            MetaLogError::Encoding(_) => "RK_METALOG_ENCODING",
            MetaLogError::Closed => "RK_METALOG_CLOSED",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, MetaLogError::Corruption { .. } | MetaLogError::Io { .. })
    }
}
