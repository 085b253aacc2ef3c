//! File-backed metalog
//!
//! Entities live in numbered files under `<log_dir>/rsml/`. Opening reads
//! the newest file, then writes every live entity into a fresh file (via a
//! temporary name and rename) so the newest file is always a complete
//! snapshot followed by appended updates. Older files beyond the retention
//! count are deleted.
//!
//! A record cut short at the end of the newest file is the trace of a crash
//! mid-append and is ignored. Any other damage is corruption.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::crash_point::{maybe_crash, points};
use crate::observability::Logger;

use super::entity::{decode_record, encode_removal, encode_state, Decoded, Entity, MetaLogRecord};
use super::errors::{MetaLogError, MetaLogResult};
use super::store::MetaLogStore;

/// Directory under the node log directory holding metalog files.
pub const METALOG_DIR: &str = "rsml";

const TMP_SUFFIX: &str = ".tmp";

struct State {
    file: File,
    path: PathBuf,
    entities: BTreeMap<i64, Entity>,
    next_id: i64,
    closed: bool,
}

pub struct FileMetaLog {
    dir: PathBuf,
    state: Mutex<State>,
}

/// Contents of one metalog file.
#[derive(Debug, Default)]
pub struct MetaLogScan {
    pub entities: BTreeMap<i64, Entity>,
    pub max_id: i64,
    pub records: usize,
    pub torn_tail: bool,
}

impl FileMetaLog {
    /// Opens the metalog under `log_dir`, keeping at most `max_files` files.
    pub fn open(log_dir: &Path, max_files: usize) -> MetaLogResult<Self> {
        let dir = log_dir.join(METALOG_DIR);
        fs::create_dir_all(&dir).map_err(|e| MetaLogError::io(&dir, e))?;
        remove_temporaries(&dir)?;

        let files = list_files(&dir)?;
        let scan = match files.last() {
            Some((_, newest)) => scan_file(newest)?,
            None => MetaLogScan::default(),
        };
        if scan.torn_tail {
            Logger::warn(
                "METALOG_TORN_TAIL_IGNORED",
                &[("dir", &dir.display().to_string())],
            );
        }

        let number = files.last().map(|(n, _)| n + 1).unwrap_or(0);
        let path = dir.join(number.to_string());
        let tmp = dir.join(format!("{}{}", number, TMP_SUFFIX));
        {
            let mut out = File::create(&tmp).map_err(|e| MetaLogError::io(&tmp, e))?;
            for entity in scan.entities.values() {
                out.write_all(&encode_state(entity)?)
                    .map_err(|e| MetaLogError::io(&tmp, e))?;
            }
            out.sync_all().map_err(|e| MetaLogError::io(&tmp, e))?;
        }
        maybe_crash(points::METALOG_BEFORE_RENAME);
        fs::rename(&tmp, &path).map_err(|e| MetaLogError::io(&path, e))?;
        sync_dir(&dir)?;

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| MetaLogError::io(&path, e))?;

        let keep = max_files.max(1);
        let mut all = files;
        all.push((number, path.clone()));
        if all.len() > keep {
            for (_, old) in &all[..all.len() - keep] {
                fs::remove_file(old).map_err(|e| MetaLogError::io(old, e))?;
            }
        }

        Logger::info(
            "METALOG_OPENED",
            &[
                ("entities", &scan.entities.len().to_string()),
                ("file", &path.display().to_string()),
            ],
        );

        Ok(Self {
            dir,
            state: Mutex::new(State {
                file,
                path,
                entities: scan.entities,
                next_id: scan.max_id + 1,
                closed: false,
            }),
        })
    }

    /// Reads the live entities under `log_dir` without modifying anything.
    pub fn read_entities(log_dir: &Path) -> MetaLogResult<Vec<Entity>> {
        let dir = log_dir.join(METALOG_DIR);
        let files = list_files(&dir)?;
        match files.last() {
            Some((_, newest)) => Ok(scan_file(newest)?.entities.into_values().collect()),
            None => Ok(Vec::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File currently receiving appends.
    pub fn current_file(&self) -> PathBuf {
        self.state.lock().unwrap().path.clone()
    }

    fn append(state: &mut State, bytes: &[u8]) -> MetaLogResult<()> {
        if state.closed {
            return Err(MetaLogError::Closed);
        }
        state
            .file
            .write_all(bytes)
            .and_then(|_| state.file.sync_all())
            .map_err(|e| MetaLogError::io(&state.path, e))
    }
}

impl MetaLogStore for FileMetaLog {
    fn get_entities(&self) -> MetaLogResult<Vec<Entity>> {
        let state = self.state.lock().unwrap();
        Ok(state.entities.values().cloned().collect())
    }

    fn record_state(&self, entities: &[Entity]) -> MetaLogResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for entity in entities {
            buf.extend(encode_state(entity)?);
        }
        let mut state = self.state.lock().unwrap();
        Self::append(&mut state, &buf)?;
        for entity in entities {
            state.next_id = state.next_id.max(entity.id() + 1);
            state.entities.insert(entity.id(), entity.clone());
        }
        Ok(())
    }

    fn record_removal(&self, entity: &Entity) -> MetaLogResult<()> {
        let bytes = encode_removal(entity);
        let mut state = self.state.lock().unwrap();
        Self::append(&mut state, &bytes)?;
        state.entities.remove(&entity.id());
        Ok(())
    }

    fn next_entity_id(&self) -> i64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    fn close(&self) -> MetaLogResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Ok(());
        }
        state
            .file
            .sync_all()
            .map_err(|e| MetaLogError::io(&state.path, e))?;
        state.closed = true;
        Ok(())
    }
}

fn list_files(dir: &Path) -> MetaLogResult<Vec<(u64, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(MetaLogError::io(dir, e)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| MetaLogError::io(dir, e))?;
        if let Ok(n) = entry.file_name().to_string_lossy().parse::<u64>() {
            files.push((n, entry.path()));
        }
    }
    files.sort_by_key(|(n, _)| *n);
    Ok(files)
}

fn remove_temporaries(dir: &Path) -> MetaLogResult<()> {
    for entry in fs::read_dir(dir).map_err(|e| MetaLogError::io(dir, e))? {
        let entry = entry.map_err(|e| MetaLogError::io(dir, e))?;
        if entry.file_name().to_string_lossy().ends_with(TMP_SUFFIX) {
            let path = entry.path();
            fs::remove_file(&path).map_err(|e| MetaLogError::io(&path, e))?;
        }
    }
    Ok(())
}

fn sync_dir(dir: &Path) -> MetaLogResult<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| MetaLogError::io(dir, e))
}

/// Replays every record of one metalog file.
pub fn scan_file(path: &Path) -> MetaLogResult<MetaLogScan> {
    let data = fs::read(path).map_err(|e| MetaLogError::io(path, e))?;
    let mut scan = MetaLogScan::default();
    let mut offset = 0usize;

    while offset < data.len() {
        match decode_record(&data[offset..]) {
            Ok(Decoded::Record(record, used)) => {
                match record {
                    MetaLogRecord::State(entity) => {
                        scan.max_id = scan.max_id.max(entity.id());
                        scan.entities.insert(entity.id(), entity);
                    }
                    MetaLogRecord::Removal { id, .. } => {
                        scan.max_id = scan.max_id.max(id);
                        scan.entities.remove(&id);
                    }
                }
                scan.records += 1;
                offset += used;
            }
            Ok(Decoded::Torn) => {
                scan.torn_tail = true;
                break;
            }
            Err(reason) => {
                return Err(MetaLogError::corruption(path, offset as u64, reason));
            }
        }
    }
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metalog::entity::RangeEntity;
    use crate::range::{QualifiedRangeSpec, RangeSpec, RangeState, TableIdentifier};
    use tempfile::TempDir;

    fn range(id: i64, end_row: &str) -> Entity {
        Entity::Range(RangeEntity::new(
            id,
            QualifiedRangeSpec::new(TableIdentifier::new("3", 1), RangeSpec::new("", end_row)),
            RangeState::steady(),
        ))
    }

    #[test]
    fn test_empty_directory_opens_empty() {
        let tmp = TempDir::new().unwrap();
        let log = FileMetaLog::open(tmp.path(), 4).unwrap();
        assert!(log.get_entities().unwrap().is_empty());
        assert_eq!(log.next_entity_id(), 1);
    }

    #[test]
    fn test_newer_state_replaces_older_by_id() {
        let tmp = TempDir::new().unwrap();
        {
            let log = FileMetaLog::open(tmp.path(), 4).unwrap();
            log.record_state(&[range(1, "m")]).unwrap();
            log.record_state(&[range(1, "z")]).unwrap();
            log.close().unwrap();
        }
        let log = FileMetaLog::open(tmp.path(), 4).unwrap();
        let entities = log.get_entities().unwrap();
        assert_eq!(entities.len(), 1);
        match &entities[0] {
            Entity::Range(e) => assert_eq!(e.spec.range.end_row, "z"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_removal_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let log = FileMetaLog::open(tmp.path(), 4).unwrap();
            log.record_state(&[range(1, "m"), range(2, "z")]).unwrap();
            log.record_removal(&range(1, "m")).unwrap();
        }
        let log = FileMetaLog::open(tmp.path(), 4).unwrap();
        let ids: Vec<i64> = log.get_entities().unwrap().iter().map(Entity::id).collect();
        assert_eq!(ids, vec![2]);
        assert_eq!(log.next_entity_id(), 3);
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let path = {
            let log = FileMetaLog::open(tmp.path(), 4).unwrap();
            log.record_state(&[range(1, "m")]).unwrap();
            log.current_file()
        };
        let partial = encode_state(&range(2, "z")).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..partial.len() / 2]).unwrap();

        let log = FileMetaLog::open(tmp.path(), 4).unwrap();
        let ids: Vec<i64> = log.get_entities().unwrap().iter().map(Entity::id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_corrupt_record_fails_open() {
        let tmp = TempDir::new().unwrap();
        let path = {
            let log = FileMetaLog::open(tmp.path(), 4).unwrap();
            log.record_state(&[range(1, "m")]).unwrap();
            log.current_file()
        };
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0x01;
        fs::write(&path, data).unwrap();

        let err = FileMetaLog::open(tmp.path(), 4).err().unwrap();
        assert_eq!(err.code(), "RK_METALOG_CORRUPTION");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_damaged_length_mid_file_fails_open() {
        let tmp = TempDir::new().unwrap();
        let path = {
            let log = FileMetaLog::open(tmp.path(), 4).unwrap();
            log.record_state(&[range(1, "m")]).unwrap();
            log.record_state(&[range(2, "z")]).unwrap();
            log.current_file()
        };
        let mut data = fs::read(&path).unwrap();
        // High byte of the first record's length field
        data[27] ^= 0x40;
        fs::write(&path, &data).unwrap();

        let err = FileMetaLog::open(tmp.path(), 4).err().unwrap();
        assert_eq!(err.code(), "RK_METALOG_CORRUPTION");
        assert!(err.is_fatal());
        // Nothing was compacted over the damaged file
        assert_eq!(fs::read(&path).unwrap(), data);
    }

    #[test]
    fn test_old_files_are_pruned() {
        let tmp = TempDir::new().unwrap();
        for _ in 0..5 {
            let log = FileMetaLog::open(tmp.path(), 2).unwrap();
            log.record_state(&[range(1, "m")]).unwrap();
        }
        let files = list_files(&tmp.path().join(METALOG_DIR)).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(FileMetaLog::read_entities(tmp.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_closed_log_rejects_writes() {
        let tmp = TempDir::new().unwrap();
        let log = FileMetaLog::open(tmp.path(), 4).unwrap();
        log.close().unwrap();
        assert!(matches!(
            log.record_state(&[range(1, "m")]),
            Err(MetaLogError::Closed)
        ));
    }
}
