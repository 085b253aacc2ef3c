//! CLI argument definitions using clap
//!
//! Commands:
//! - rangekeeper recover --config <path> [--abort-on-fatal]
//! - rangekeeper dump-metalog --dir <log_dir>
//! - rangekeeper dump-log --dir <class_log_dir> [--fragments 3,4]
//! - rangekeeper mark-log --dir <class_log_dir> --fragment <id>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// rangekeeper - range-server recovery and failover tooling
#[derive(Parser, Debug)]
#[command(name = "rangekeeper")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run local recovery for a node and print the report
    Recover {
        /// Path to node configuration file
        #[arg(long, default_value = "./rangekeeper.json")]
        config: PathBuf,

        /// Abort the process on a fatal recovery error, as a range server does
        #[arg(long)]
        abort_on_fatal: bool,
    },

    /// Print the live entities of a node's metalog
    DumpMetalog {
        /// Node log directory (the one holding `rsml`)
        #[arg(long)]
        dir: PathBuf,
    },

    /// Print the blocks of a class commit log
    DumpLog {
        /// Class log directory
        #[arg(long)]
        dir: PathBuf,

        /// Only these fragments
        #[arg(long, value_delimiter = ',')]
        fragments: Option<Vec<u32>>,
    },

    /// Truncate a class log: fragments below the mark are no longer read
    MarkLog {
        /// Class log directory
        #[arg(long)]
        dir: PathBuf,

        #[arg(long)]
        fragment: u32,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
