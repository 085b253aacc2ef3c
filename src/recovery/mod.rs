//! Local recovery
//!
//! Rebuilds a node's range ownership after a restart. Classes replay in
//! strict dependency order (root, metadata, system, user) because locating
//! a range requires the metadata table, and user requests may need system
//! tables. Each class's barrier gate opens only once that class is merged
//! into the live range table.

mod barrier;
mod context;
mod errors;
mod local;
mod replay;

pub use barrier::LogReplayBarrier;
pub use context::NodeContext;
pub use errors::{RecoveryError, RecoveryResult};
pub use local::{ClassReport, LocalRecoveryCoordinator, RecoveryReport};
pub use replay::{replay_log, BlockSource, ReplayStats};
