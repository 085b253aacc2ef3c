//! CLI command implementations
//!
//! `recover` runs the same startup sequence a range server runs and prints
//! its report. The other commands inspect or truncate on-disk logs and
//! never modify anything they read.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::commitlog::{write_mark, CommitLogReader};
use crate::config::NodeConfig;
use crate::metalog::{Entity, FileMetaLog};
use crate::observability::{Event, Logger};
use crate::range::verify_partition;
use crate::recovery::{LocalRecoveryCoordinator, NodeContext};

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::write_response;

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    let data = match cmd {
        Command::Recover {
            config,
            abort_on_fatal,
        } => recover(&config, abort_on_fatal)?,
        Command::DumpMetalog { dir } => dump_metalog(&dir)?,
        Command::DumpLog { dir, fragments } => dump_log(&dir, fragments.as_deref())?,
        Command::MarkLog { dir, fragment } => mark_log(&dir, fragment)?,
    };
    write_response(data)
}

/// Recovers the node described by `config_path`, then shuts it down.
pub fn recover(config_path: &Path, abort_on_fatal: bool) -> CliResult<Value> {
    let config = NodeConfig::load(config_path)?;
    Logger::event(
        Event::ConfigLoaded,
        &[
            ("config", &config_path.display().to_string()),
            ("location", &config.location),
        ],
    );
    Logger::event(Event::NodeStart, &[("location", &config.location)]);

    let ctx = Arc::new(NodeContext::new(config));
    let coordinator = LocalRecoveryCoordinator::new(ctx.clone());
    let result = if abort_on_fatal {
        Ok(coordinator.recover_or_abort())
    } else {
        coordinator.recover()
    };
    let shutdown = ctx.shutdown();
    let report = result?;
    shutdown?;

    let partition: Vec<String> = verify_partition(ctx.live_map.specs())
        .iter()
        .map(ToString::to_string)
        .collect();
    Ok(json!({
        "report": serde_json::to_value(&report)?,
        "partition_issues": partition,
        "ranges": ctx.live_map.specs().iter().map(|s| s.name()).collect::<Vec<_>>(),
        "metrics": serde_json::to_value(ctx.metrics.snapshot())?,
    }))
}

/// Lists the live entities of the metalog under `log_dir`.
pub fn dump_metalog(log_dir: &Path) -> CliResult<Value> {
    let mut entities = FileMetaLog::read_entities(log_dir)?;
    entities.sort_by_key(Entity::id);

    let mut out = Vec::with_capacity(entities.len());
    for entity in &entities {
        let body = match entity {
            Entity::Range(range) => serde_json::to_value(range)?,
            Entity::RemoveOkLogs(logs) => serde_json::to_value(logs)?,
        };
        out.push(json!({
            "id": entity.id(),
            "type": entity.type_name(),
            "timestamp": entity.timestamp(),
            "entity": body,
        }));
    }
    Ok(json!({ "entities": out }))
}

/// Lists the blocks of the class log at `dir`.
pub fn dump_log(dir: &Path, fragments: Option<&[u32]>) -> CliResult<Value> {
    let mut reader = match fragments {
        Some(ids) => CommitLogReader::open_fragments(dir, ids, false)?,
        None => CommitLogReader::open(dir, false)?,
    };

    let mut blocks = Vec::new();
    while let Some(block) = reader.next()? {
        blocks.push(json!({
            "fragment_id": block.fragment_id,
            "revision": block.revision,
            "table": block.table.id,
            "generation": block.table.generation,
            "pairs": block.pairs.len(),
        }));
    }
    Ok(json!({
        "blocks": blocks,
        "linked_logs": reader.linked_logs(),
        "last_fragment_id": reader.last_fragment_id(),
    }))
}

pub fn mark_log(dir: &Path, fragment: u32) -> CliResult<Value> {
    if !dir.is_dir() {
        return Err(CliError::log_error(format!(
            "{} is not a log directory",
            dir.display()
        )));
    }
    let path = write_mark(dir, fragment)?;
    Ok(json!({ "mark": path }))
}
