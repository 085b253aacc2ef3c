//! Commit-log reader
//!
//! Iterates the blocks of a class directory fragment by fragment, in
//! ascending fragment order. LINK blocks are followed: the linked log is
//! read in full at the point the link appears, and its directory is added
//! to the set returned by `linked_logs`.
//!
//! A fragment that fails validation is reported as `CorruptFragment`.
//! Blocks already returned from it stay returned; there is no rollback. When
//! corrupt fragments are skipped, the rest of the damaged fragment is
//! dropped with a WARN log and iteration continues with the next fragment.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::observability::Logger;
use crate::range::TableIdentifier;

use super::block::{decode_block, BlockBody};
use super::errors::{CommitLogError, CommitLogResult};
use super::kv::KeyValue;

/// Suffix of truncation marks.
pub const MARK_SUFFIX: &str = ".mark";

/// A DATA block as seen by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBlock {
    /// Fragment of the log being read; blocks of a linked log report the
    /// fragment holding the link.
    pub fragment_id: u32,
    pub revision: i64,
    pub table: TableIdentifier,
    pub pairs: Vec<KeyValue>,
}

/// Directory listing of one class log.
#[derive(Debug, Clone, Default)]
pub struct FragmentListing {
    pub fragments: Vec<(u32, PathBuf)>,
    pub marks: Vec<u32>,
}

impl FragmentListing {
    /// Highest mark, if any.
    pub fn highest_mark(&self) -> Option<u32> {
        self.marks.iter().copied().max()
    }

    /// Fragments a full-directory read covers: those at or above the
    /// highest mark.
    pub fn live_fragments(&self) -> Vec<(u32, PathBuf)> {
        let floor = self.highest_mark().unwrap_or(0);
        self.fragments
            .iter()
            .filter(|(id, _)| *id >= floor)
            .cloned()
            .collect()
    }

    pub fn max_fragment_id(&self) -> Option<u32> {
        self.fragments.iter().map(|(id, _)| *id).max()
    }
}

/// Lists numbered fragments and marks in `dir`.
///
/// A missing directory lists as empty.
pub fn list_fragments(dir: &Path) -> CommitLogResult<FragmentListing> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FragmentListing::default()),
        Err(e) => return Err(CommitLogError::io(dir, e)),
    };

    let mut listing = FragmentListing::default();
    for entry in entries {
        let entry = entry.map_err(|e| CommitLogError::io(dir, e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(MARK_SUFFIX) {
            if let Ok(id) = stem.parse::<u32>() {
                listing.marks.push(id);
            }
        } else if let Ok(id) = name.parse::<u32>() {
            listing.fragments.push((id, entry.path()));
        }
    }
    listing.fragments.sort_by_key(|(id, _)| *id);
    listing.marks.sort_unstable();
    Ok(listing)
}

struct OpenFragment {
    id: u32,
    path: PathBuf,
    data: Vec<u8>,
    offset: usize,
}

pub struct CommitLogReader {
    dir: PathBuf,
    fragments: Vec<(u32, PathBuf)>,
    next_index: usize,
    current: Option<OpenFragment>,
    nested: Option<Box<CommitLogReader>>,
    /// Directories on the link chain above this reader, to break cycles
    ancestors: Vec<PathBuf>,
    linked_logs: BTreeSet<PathBuf>,
    skip_corrupt: bool,
    last_fragment_id: Option<u32>,
    skipped_fragments: Vec<u32>,
    blocks_read: u64,
}

impl CommitLogReader {
    /// Opens every live fragment of `dir`.
    ///
    /// Fragments numbered below the highest `.mark` file belong to a
    /// truncated sequence and are not read.
    pub fn open(dir: &Path, skip_corrupt: bool) -> CommitLogResult<Self> {
        let listing = list_fragments(dir)?;
        Ok(Self::with_fragments(
            dir,
            listing.live_fragments(),
            skip_corrupt,
            Vec::new(),
        ))
    }

    /// Opens exactly the listed fragments of `dir`, in ascending order.
    pub fn open_fragments(
        dir: &Path,
        fragment_ids: &[u32],
        skip_corrupt: bool,
    ) -> CommitLogResult<Self> {
        let listing = list_fragments(dir)?;
        let wanted: BTreeSet<u32> = fragment_ids.iter().copied().collect();
        let mut selected = Vec::with_capacity(wanted.len());
        for id in &wanted {
            match listing.fragments.iter().find(|(fid, _)| fid == id) {
                Some(entry) => selected.push(entry.clone()),
                None => {
                    return Err(CommitLogError::FragmentMissing {
                        fragment_id: *id,
                        dir: dir.to_path_buf(),
                    })
                }
            }
        }
        Ok(Self::with_fragments(dir, selected, skip_corrupt, Vec::new()))
    }

    fn with_fragments(
        dir: &Path,
        fragments: Vec<(u32, PathBuf)>,
        skip_corrupt: bool,
        ancestors: Vec<PathBuf>,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            fragments,
            next_index: 0,
            current: None,
            nested: None,
            ancestors,
            linked_logs: BTreeSet::new(),
            skip_corrupt,
            last_fragment_id: None,
            skipped_fragments: Vec::new(),
            blocks_read: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fragment ids this reader will visit.
    pub fn fragment_ids(&self) -> Vec<u32> {
        self.fragments.iter().map(|(id, _)| *id).collect()
    }

    /// Fragment of the most recently returned block.
    pub fn last_fragment_id(&self) -> Option<u32> {
        self.last_fragment_id
    }

    /// Every log directory reached through a LINK block so far.
    pub fn linked_logs(&self) -> BTreeSet<PathBuf> {
        let mut all = self.linked_logs.clone();
        if let Some(nested) = &self.nested {
            all.extend(nested.linked_logs());
        }
        all
    }

    /// Fragments dropped because of corruption.
    pub fn skipped_fragments(&self) -> &[u32] {
        &self.skipped_fragments
    }

    pub fn blocks_read(&self) -> u64 {
        self.blocks_read
    }

    /// Returns the next DATA block, or `None` at end of log.
    pub fn next(&mut self) -> CommitLogResult<Option<LogBlock>> {
        loop {
            if let Some(nested) = self.nested.as_mut() {
                match nested.next()? {
                    Some(mut block) => {
                        if let Some(id) = self.current.as_ref().map(|f| f.id) {
                            block.fragment_id = id;
                        }
                        self.blocks_read += 1;
                        return Ok(Some(block));
                    }
                    None => {
                        self.linked_logs.extend(nested.linked_logs());
                        self.skipped_fragments
                            .extend_from_slice(nested.skipped_fragments());
                        self.nested = None;
                        continue;
                    }
                }
            }

            if self.current.is_none() {
                if self.next_index >= self.fragments.len() {
                    return Ok(None);
                }
                let (id, path) = self.fragments[self.next_index].clone();
                self.next_index += 1;
                let data = fs::read(&path).map_err(|e| CommitLogError::io(&path, e))?;
                self.current = Some(OpenFragment {
                    id,
                    path,
                    data,
                    offset: 0,
                });
            }

            let Some(fragment) = self.current.as_mut() else {
                continue;
            };
            if fragment.offset >= fragment.data.len() {
                self.current = None;
                continue;
            }

            match decode_block(&fragment.data[fragment.offset..]) {
                Ok((block, consumed)) => {
                    fragment.offset += consumed;
                    self.last_fragment_id = Some(fragment.id);
                    match block.body {
                        BlockBody::Data { table, pairs } => {
                            self.blocks_read += 1;
                            return Ok(Some(LogBlock {
                                fragment_id: fragment.id,
                                revision: block.header.revision,
                                table,
                                pairs,
                            }));
                        }
                        BlockBody::Link { dir } => {
                            if dir == self.dir
                                || self.ancestors.contains(&dir)
                                || self.linked_logs.contains(&dir)
                            {
                                continue;
                            }
                            let listing = list_fragments(&dir)?;
                            let mut ancestors = self.ancestors.clone();
                            ancestors.push(self.dir.clone());
                            self.linked_logs.insert(dir.clone());
                            self.nested = Some(Box::new(Self::with_fragments(
                                &dir,
                                listing.live_fragments(),
                                self.skip_corrupt,
                                ancestors,
                            )));
                        }
                    }
                }
                Err(e) => {
                    let fragment_id = fragment.id;
                    let path = fragment.path.clone();
                    let at = fragment.offset;
                    self.current = None;
                    let reason = format!("at offset {}: {}", at, e);
                    if self.skip_corrupt {
                        Logger::warn(
                            "COMMITLOG_FRAGMENT_SKIPPED",
                            &[
                                ("fragment", &fragment_id.to_string()),
                                ("path", &path.display().to_string()),
                                ("reason", &reason),
                            ],
                        );
                        self.skipped_fragments.push(fragment_id);
                        continue;
                    }
                    return Err(CommitLogError::CorruptFragment {
                        fragment_id,
                        path,
                        reason,
                    });
                }
            }
        }
    }
}
