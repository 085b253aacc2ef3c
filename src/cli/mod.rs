//! CLI module for rangekeeper
//!
//! Provides command-line interface for:
//! - recover: Run local recovery for a node
//! - dump-metalog: Inspect a node's metalog
//! - dump-log: Inspect a class commit log
//! - mark-log: Truncate a class commit log

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{dump_log, dump_metalog, mark_log, recover, run, run_command};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::write_response;
