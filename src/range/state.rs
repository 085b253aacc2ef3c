//! Persisted range state
//!
//! A range is either steady or part-way through a split or relinquish.
//! The PHANTOM bit marks a range that was materialized for a failover
//! takeover but not yet committed to this node.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Path segment every transfer log directory lives under.
pub const PHANTOM_LOG_SEGMENT: &str = "phantom";

/// Maintenance progress of a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RangeStateKind {
    Steady,
    /// Split log written, split-off half not yet handed over
    SplitLogInstalled,
    /// Range boundaries shrunk, split-off half not yet acknowledged
    SplitShrunk,
    /// Relinquish log written, range not yet handed over
    RelinquishLogInstalled,
}

impl RangeStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RangeStateKind::Steady => "STEADY",
            RangeStateKind::SplitLogInstalled => "SPLIT_LOG_INSTALLED",
            RangeStateKind::SplitShrunk => "SPLIT_SHRUNK",
            RangeStateKind::RelinquishLogInstalled => "RELINQUISH_LOG_INSTALLED",
        }
    }

    /// Whether a split was in flight when the state was persisted.
    pub fn is_splitting(&self) -> bool {
        matches!(
            self,
            RangeStateKind::SplitLogInstalled | RangeStateKind::SplitShrunk
        )
    }

    pub fn is_relinquishing(&self) -> bool {
        matches!(self, RangeStateKind::RelinquishLogInstalled)
    }
}

impl fmt::Display for RangeStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Flag bits carried next to the state kind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct RangeFlags: u32 {
        /// Range staged for takeover, never adopted
        const PHANTOM = 0x80;
    }
}

impl Default for RangeFlags {
    fn default() -> Self {
        RangeFlags::empty()
    }
}

/// State persisted with every range entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeState {
    pub kind: RangeStateKind,
    #[serde(default)]
    pub flags: RangeFlags,
    /// Log holding mutations destined for this range but not yet in its
    /// owner's main log.
    #[serde(default)]
    pub transfer_log: Option<PathBuf>,
    #[serde(default)]
    pub split_point: Option<String>,
    #[serde(default)]
    pub old_boundary_row: Option<String>,
    #[serde(default)]
    pub soft_limit: u64,
}

impl RangeState {
    pub fn steady() -> Self {
        Self {
            kind: RangeStateKind::Steady,
            flags: RangeFlags::empty(),
            transfer_log: None,
            split_point: None,
            old_boundary_row: None,
            soft_limit: 0,
        }
    }

    pub fn with_kind(kind: RangeStateKind) -> Self {
        Self {
            kind,
            ..Self::steady()
        }
    }

    pub fn is_phantom(&self) -> bool {
        self.flags.contains(RangeFlags::PHANTOM)
    }

    /// Whether the transfer log is a failover staging directory that can be
    /// deleted once the phantom range is discarded.
    pub fn has_phantom_transfer_log(&self) -> bool {
        self.transfer_log
            .as_deref()
            .map(is_phantom_log_path)
            .unwrap_or(false)
    }
}

impl Default for RangeState {
    fn default() -> Self {
        Self::steady()
    }
}

/// Whether `path` has a `phantom` directory component.
pub fn is_phantom_log_path(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(name) => name == PHANTOM_LOG_SEGMENT,
        _ => false,
    })
}
