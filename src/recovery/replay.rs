//! Commit-log replay into a range table
//!
//! Every pair is offered to the range that currently contains its row.
//! Ranges only accept rows inside their current boundaries, so replaying a
//! log that still holds mutations for rows since split away, or replaying
//! the same fragment twice, never applies a pair outside its owner.

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::commitlog::{CommitLogReader, LogBlock};
use crate::observability::MetricsRegistry;
use crate::range::LiveRangeTable;

use super::errors::RecoveryResult;

/// Forward iterator over the DATA blocks of a log.
pub trait BlockSource {
    /// Next block, `None` at end of log. Corruption is an error unless the
    /// source was opened to skip it.
    fn next_block(&mut self) -> RecoveryResult<Option<LogBlock>>;

    /// Fragments dropped because of corruption so far.
    fn skipped_fragments(&self) -> Vec<u32>;

    /// Log directories reached through link blocks so far.
    fn linked_logs(&self) -> BTreeSet<PathBuf>;
}

impl BlockSource for CommitLogReader {
    fn next_block(&mut self) -> RecoveryResult<Option<LogBlock>> {
        Ok(self.next()?)
    }

    fn skipped_fragments(&self) -> Vec<u32> {
        CommitLogReader::skipped_fragments(self).to_vec()
    }

    fn linked_logs(&self) -> BTreeSet<PathBuf> {
        CommitLogReader::linked_logs(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub blocks_replayed: u64,
    pub pairs_applied: u64,
    /// Pairs whose row no owned range contains
    pub pairs_skipped: u64,
    pub last_fragment_id: Option<u32>,
    pub skipped_fragments: Vec<u32>,
    pub linked_logs: BTreeSet<PathBuf>,
}

/// Replays `source` to the end into `ranges`.
///
/// On error, pairs applied before the failure stay applied.
pub fn replay_log<S: BlockSource + ?Sized>(
    source: &mut S,
    ranges: &LiveRangeTable,
    metrics: &MetricsRegistry,
) -> RecoveryResult<ReplayStats> {
    let mut stats = ReplayStats::default();

    while let Some(block) = source.next_block()? {
        stats.blocks_replayed += 1;
        stats.last_fragment_id = Some(block.fragment_id);
        metrics.increment_blocks_replayed();

        let mut applied = 0;
        for kv in &block.pairs {
            match ranges.find_containing_range(&block.table.id, kv.row()) {
                Some(range) if range.add(kv) => applied += 1,
                _ => {}
            }
        }
        let skipped = block.pairs.len() as u64 - applied;
        stats.pairs_applied += applied;
        stats.pairs_skipped += skipped;
        metrics.add_pairs_applied(applied);
        metrics.add_pairs_skipped(skipped);
    }

    stats.skipped_fragments = source.skipped_fragments();
    stats.linked_logs = source.linked_logs();
    metrics.add_corrupt_fragments_skipped(stats.skipped_fragments.len() as u64);
    Ok(stats)
}
