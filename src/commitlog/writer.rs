//! Commit-log writer
//!
//! Appends blocks to the newest fragment of a class directory, fsyncing
//! after every block. Existing fragments are never reopened: a writer
//! created over a directory that already holds fragments starts a new one
//! numbered past the highest existing id.
//!
//! Appends are serialized by the writer's own lock.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::crash_point::{maybe_crash, points};
use crate::observability::Logger;
use crate::range::TableIdentifier;
use crate::util::retry::RetryPolicy;

use super::block::{encode_data_block, encode_link_block};
use super::errors::{CommitLogError, CommitLogResult};
use super::kv::KeyValue;
use super::reader::{list_fragments, MARK_SUFFIX};

struct WriterState {
    file: File,
    fragment_id: u32,
    fragment_bytes: u64,
    total_bytes: u64,
    latest_revision: i64,
    linked: HashSet<[u8; 32]>,
    closed: bool,
}

pub struct CommitLog {
    dir: PathBuf,
    cluster_id: u64,
    roll_limit: u64,
    retry: RetryPolicy,
    state: Mutex<WriterState>,
}

impl CommitLog {
    /// Creates a writer over `dir`, creating the directory if needed.
    pub fn create(dir: &Path, cluster_id: u64, roll_limit: u64) -> CommitLogResult<Self> {
        Self::create_with_retry(dir, cluster_id, roll_limit, RetryPolicy::none())
    }

    /// Like `create`, retrying failed appends with `retry`.
    pub fn create_with_retry(
        dir: &Path,
        cluster_id: u64,
        roll_limit: u64,
        retry: RetryPolicy,
    ) -> CommitLogResult<Self> {
        fs::create_dir_all(dir).map_err(|e| CommitLogError::io(dir, e))?;
        let listing = list_fragments(dir)?;
        let fragment_id = listing.max_fragment_id().map(|id| id + 1).unwrap_or(0);
        let file = open_fragment(dir, fragment_id)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            cluster_id,
            roll_limit: roll_limit.max(1),
            retry,
            state: Mutex::new(WriterState {
                file,
                fragment_id,
                fragment_bytes: 0,
                total_bytes: 0,
                latest_revision: 0,
                linked: HashSet::new(),
                closed: false,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    /// Fragment currently receiving appends.
    pub fn current_fragment_id(&self) -> u32 {
        self.state.lock().unwrap().fragment_id
    }

    /// Whether nothing has been appended through this writer.
    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().total_bytes == 0
    }

    pub fn latest_revision(&self) -> i64 {
        self.state.lock().unwrap().latest_revision
    }

    /// Appends one DATA block for `table`.
    pub fn write(&self, table: &TableIdentifier, pairs: &[KeyValue], revision: i64) -> CommitLogResult<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let block = encode_data_block(self.cluster_id, revision, table, pairs);
        let mut state = self.state.lock().unwrap();
        self.append(&mut state, &block)?;
        state.latest_revision = state.latest_revision.max(revision);
        if state.fragment_bytes >= self.roll_limit {
            self.roll_locked(&mut state)?;
        }
        Ok(())
    }

    /// Splices the log at `log_dir` into this one.
    ///
    /// Writes a LINK block naming `log_dir` and rolls to a new fragment so
    /// the link closes its fragment. Returns `false` without writing when
    /// `log_dir` was already linked through this writer.
    pub fn link_log(&self, cluster_id: u64, log_dir: &Path) -> CommitLogResult<bool> {
        let digest: [u8; 32] = Sha256::digest(log_dir.to_string_lossy().as_bytes()).into();
        let mut state = self.state.lock().unwrap();
        if state.linked.contains(&digest) {
            return Ok(false);
        }

        let revision = chrono::Utc::now().timestamp_micros().max(state.latest_revision);
        let block = encode_link_block(cluster_id, revision, log_dir);
        self.append(&mut state, &block)?;
        maybe_crash(points::COMMITLOG_AFTER_LINK);
        state.linked.insert(digest);
        state.latest_revision = revision;
        self.roll_locked(&mut state)?;

        Logger::info(
            "COMMITLOG_LINKED",
            &[
                ("dir", &self.dir.display().to_string()),
                ("linked", &log_dir.display().to_string()),
            ],
        );
        Ok(true)
    }

    /// Closes the current fragment and starts the next one.
    pub fn roll(&self) -> CommitLogResult<()> {
        let mut state = self.state.lock().unwrap();
        self.roll_locked(&mut state)
    }

    /// Syncs and refuses further appends.
    pub fn close(&self) -> CommitLogResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Ok(());
        }
        state
            .file
            .sync_all()
            .map_err(|e| CommitLogError::io(&self.dir, e))?;
        state.closed = true;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn append(&self, state: &mut WriterState, block: &[u8]) -> CommitLogResult<()> {
        if state.closed {
            return Err(CommitLogError::Closed {
                dir: self.dir.clone(),
            });
        }
        let path = fragment_path(&self.dir, state.fragment_id);
        let start = state.fragment_bytes;
        let file = &mut state.file;
        self.retry.run(
            |attempt| {
                // Drop whatever a failed attempt left behind.
                if attempt > 0 {
                    file.set_len(start).map_err(|e| CommitLogError::io(&path, e))?;
                }
                file.write_all(block)
                    .and_then(|_| file.sync_all())
                    .map_err(|e| CommitLogError::io(&path, e))
            },
            |e| matches!(e, CommitLogError::Io { .. }),
        )?;
        state.fragment_bytes += block.len() as u64;
        state.total_bytes += block.len() as u64;
        Ok(())
    }

    fn roll_locked(&self, state: &mut WriterState) -> CommitLogResult<()> {
        if state.closed {
            return Err(CommitLogError::Closed {
                dir: self.dir.clone(),
            });
        }
        state
            .file
            .sync_all()
            .map_err(|e| CommitLogError::io(&self.dir, e))?;
        let next = state.fragment_id + 1;
        state.file = open_fragment(&self.dir, next)?;
        state.fragment_id = next;
        state.fragment_bytes = 0;
        Ok(())
    }
}

fn fragment_path(dir: &Path, fragment_id: u32) -> PathBuf {
    dir.join(fragment_id.to_string())
}

fn open_fragment(dir: &Path, fragment_id: u32) -> CommitLogResult<File> {
    let path = fragment_path(dir, fragment_id);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| CommitLogError::io(&path, e))
}

/// Writes a zero-length `<fragment_id>.mark` file in `dir`.
///
/// Full-directory readers ignore every fragment numbered below the highest
/// mark.
pub fn write_mark(dir: &Path, fragment_id: u32) -> CommitLogResult<PathBuf> {
    let path = dir.join(format!("{}{}", fragment_id, MARK_SUFFIX));
    let file = File::create(&path).map_err(|e| CommitLogError::io(&path, e))?;
    file.sync_all().map_err(|e| CommitLogError::io(&path, e))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::reader::CommitLogReader;
    use tempfile::TempDir;

    fn pairs(rows: &[&str]) -> Vec<KeyValue> {
        rows.iter()
            .map(|r| KeyValue::new(*r, "cf", 0, 1, b"v".to_vec()))
            .collect()
    }

    #[test]
    fn test_new_writer_starts_past_existing_fragments() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("user");
        {
            let log = CommitLog::create(&dir, 1, 1 << 20).unwrap();
            assert_eq!(log.current_fragment_id(), 0);
            log.write(&TableIdentifier::new("3", 1), &pairs(&["a"]), 1).unwrap();
            log.close().unwrap();
        }
        let log = CommitLog::create(&dir, 1, 1 << 20).unwrap();
        assert_eq!(log.current_fragment_id(), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn test_written_blocks_are_readable() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("user");
        let log = CommitLog::create(&dir, 1, 1 << 20).unwrap();
        log.write(&TableIdentifier::new("3", 1), &pairs(&["a", "b"]), 7).unwrap();
        log.close().unwrap();

        let mut reader = CommitLogReader::open(&dir, false).unwrap();
        let block = reader.next().unwrap().unwrap();
        assert_eq!(block.revision, 7);
        assert_eq!(block.pairs.len(), 2);
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn test_roll_limit_starts_new_fragment() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("user");
        let log = CommitLog::create(&dir, 1, 1).unwrap();
        log.write(&TableIdentifier::new("3", 1), &pairs(&["a"]), 1).unwrap();
        log.write(&TableIdentifier::new("3", 1), &pairs(&["b"]), 2).unwrap();
        assert_eq!(log.current_fragment_id(), 2);
    }

    #[test]
    fn test_link_log_is_deduplicated() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("user");
        let transfer = tmp.path().join("phantom").join("3").join("t");
        let xfer = CommitLog::create(&transfer, 1, 1 << 20).unwrap();
        xfer.write(&TableIdentifier::new("3", 1), &pairs(&["x"]), 3).unwrap();
        xfer.close().unwrap();

        let log = CommitLog::create(&dir, 1, 1 << 20).unwrap();
        assert!(log.link_log(1, &transfer).unwrap());
        let after_first = log.current_fragment_id();
        assert!(!log.link_log(1, &transfer).unwrap());
        assert_eq!(log.current_fragment_id(), after_first);

        let mut reader = CommitLogReader::open(&dir, false).unwrap();
        let block = reader.next().unwrap().unwrap();
        assert_eq!(block.pairs[0].key.row, "x");
        assert!(reader.next().unwrap().is_none());
        assert!(reader.linked_logs().contains(&transfer));
    }

    #[test]
    fn test_closed_log_rejects_writes() {
        let tmp = TempDir::new().unwrap();
        let log = CommitLog::create(&tmp.path().join("user"), 1, 1 << 20).unwrap();
        log.close().unwrap();
        let err = log
            .write(&TableIdentifier::new("3", 1), &pairs(&["a"]), 1)
            .unwrap_err();
        assert_eq!(err.code(), "RK_COMMITLOG_CLOSED");
    }

    #[test]
    fn test_mark_hides_earlier_fragments() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("user");
        let log = CommitLog::create(&dir, 1, 1 << 20).unwrap();
        log.write(&TableIdentifier::new("3", 1), &pairs(&["old"]), 1).unwrap();
        log.roll().unwrap();
        log.write(&TableIdentifier::new("3", 1), &pairs(&["new"]), 2).unwrap();
        write_mark(&dir, 1).unwrap();

        let mut reader = CommitLogReader::open(&dir, false).unwrap();
        let block = reader.next().unwrap().unwrap();
        assert_eq!(block.pairs[0].key.row, "new");
        assert!(reader.next().unwrap().is_none());
    }
}
