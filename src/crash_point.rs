//! Crash point injection for testing durability
//!
//! A crash point is enabled by naming it in the `RANGEKEEPER_CRASH_POINT`
//! environment variable. When execution reaches an enabled point the
//! process terminates via `std::process::abort()`: no cleanup, no
//! unwinding, no catching.
//!
//! Points sit between the persistence steps of recovery and failover so
//! that a test harness can kill a node at each step and check what the
//! next startup makes of the files left behind.
//!
//! ```bash
//! RANGEKEEPER_CRASH_POINT=prepare_after_link rangekeeper recover --config node.json
//! ```

use std::sync::OnceLock;

static CRASH_POINT: OnceLock<Option<String>> = OnceLock::new();

#[inline]
fn get_crash_point() -> Option<&'static str> {
    CRASH_POINT
        .get_or_init(|| std::env::var("RANGEKEEPER_CRASH_POINT").ok())
        .as_deref()
}

/// Returns true if `RANGEKEEPER_CRASH_POINT` equals `name`.
#[inline]
pub fn crash_point_enabled(name: &str) -> bool {
    get_crash_point().map(|p| p == name).unwrap_or(false)
}

/// Aborts the process if the named crash point is enabled.
#[inline]
pub fn maybe_crash(name: &str) {
    if crash_point_enabled(name) {
        eprintln!("[CRASH] Triggering crash at point: {}", name);
        std::process::abort();
    }
}

/// All defined crash point names
pub mod points {
    // Commit log
    pub const COMMITLOG_AFTER_LINK: &str = "commitlog_after_link";

    // Metalog
    pub const METALOG_BEFORE_RENAME: &str = "metalog_before_rename";

    // Local recovery
    pub const RECOVERY_AFTER_PHANTOM_STRIP: &str = "recovery_after_phantom_strip";
    pub const RECOVERY_AFTER_CLASS_MERGE: &str = "recovery_after_class_merge";
    pub const RECOVERY_BEFORE_REMOVE_OK_LOGS: &str = "recovery_before_remove_ok_logs";

    // Failover phases
    pub const PREPARE_AFTER_POPULATE: &str = "prepare_after_populate";
    pub const PREPARE_AFTER_LINK: &str = "prepare_after_link";
    pub const COMMIT_AFTER_OWNERSHIP: &str = "commit_after_ownership";
    pub const COMMIT_AFTER_MERGE: &str = "commit_after_merge";

    // Fragment replay
    pub const REPLAY_AFTER_FLUSH: &str = "replay_after_flush";

    pub fn all() -> &'static [&'static str] {
        &[
            COMMITLOG_AFTER_LINK,
            METALOG_BEFORE_RENAME,
            RECOVERY_AFTER_PHANTOM_STRIP,
            RECOVERY_AFTER_CLASS_MERGE,
            RECOVERY_BEFORE_REMOVE_OK_LOGS,
            PREPARE_AFTER_POPULATE,
            PREPARE_AFTER_LINK,
            COMMIT_AFTER_OWNERSHIP,
            COMMIT_AFTER_MERGE,
            REPLAY_AFTER_FLUSH,
        ]
    }
}
