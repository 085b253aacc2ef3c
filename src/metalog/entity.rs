//! Metalog entities and their record encoding
//!
//! Record layout (little-endian):
//!
//! ```text
//! type:u32 | id:i64 | timestamp:i64 | flags:u32 | length:u32 | checksum:u32 | header_checksum:u32 | payload
//! ```
//!
//! The payload is the JSON-encoded entity body; removal records carry an
//! empty payload and the REMOVE flag. The checksum is CRC32 over the first
//! five header fields and the payload. The header checksum is CRC32 over
//! every header byte before it, so `length` is trusted only once it matches.

use std::collections::BTreeSet;
use std::path::PathBuf;

use bitflags::bitflags;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::range::{QualifiedRangeSpec, RangeState};

use super::errors::MetaLogResult;

pub const ENTITY_TYPE_RANGE: u32 = 0x0001;
pub const ENTITY_TYPE_REMOVE_OK_LOGS: u32 = 0x0002;

pub const RECORD_HEADER_SIZE: usize = 4 + 8 + 8 + 4 + 4 + 4 + 4;

const HEADER_CHECKSUM_OFFSET: usize = RECORD_HEADER_SIZE - 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntityFlags: u32 {
        /// Tombstone for the entity with this id
        const REMOVE = 0x0001;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityHeader {
    pub entity_type: u32,
    pub id: i64,
    pub timestamp: i64,
    pub flags: EntityFlags,
    pub length: u32,
    pub checksum: u32,
    pub header_checksum: u32,
}

/// Persisted descriptor of a range this node owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeEntity {
    #[serde(skip)]
    pub id: i64,
    #[serde(skip)]
    pub timestamp: i64,
    pub spec: QualifiedRangeSpec,
    pub state: RangeState,
    #[serde(default)]
    pub load_acknowledged: bool,
    #[serde(default)]
    pub needs_compaction: bool,
}

impl RangeEntity {
    pub fn new(id: i64, spec: QualifiedRangeSpec, state: RangeState) -> Self {
        Self {
            id,
            timestamp: now_micros(),
            spec,
            state,
            load_acknowledged: true,
            needs_compaction: false,
        }
    }

    /// Refreshes the revision timestamp.
    pub fn touch(&mut self) {
        self.timestamp = now_micros();
    }
}

/// Logs no live range depends on any more.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoveOkLogsEntity {
    #[serde(skip)]
    pub id: i64,
    #[serde(skip)]
    pub timestamp: i64,
    pub logs: BTreeSet<PathBuf>,
}

impl RemoveOkLogsEntity {
    pub fn new(id: i64, logs: BTreeSet<PathBuf>) -> Self {
        Self {
            id,
            timestamp: now_micros(),
            logs,
        }
    }

    pub fn insert(&mut self, log: PathBuf) -> bool {
        self.logs.insert(log)
    }

    pub fn touch(&mut self) {
        self.timestamp = now_micros();
    }
}

/// Every entity kind the metalog stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Range(RangeEntity),
    RemoveOkLogs(RemoveOkLogsEntity),
}

impl Entity {
    pub fn id(&self) -> i64 {
        match self {
            Entity::Range(e) => e.id,
            Entity::RemoveOkLogs(e) => e.id,
        }
    }

    pub fn entity_type(&self) -> u32 {
        match self {
            Entity::Range(_) => ENTITY_TYPE_RANGE,
            Entity::RemoveOkLogs(_) => ENTITY_TYPE_REMOVE_OK_LOGS,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Entity::Range(e) => e.timestamp,
            Entity::RemoveOkLogs(e) => e.timestamp,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Entity::Range(_) => "Range",
            Entity::RemoveOkLogs(_) => "RemoveOkLogs",
        }
    }

    fn encode_payload(&self) -> MetaLogResult<Vec<u8>> {
        Ok(match self {
            Entity::Range(e) => serde_json::to_vec(e)?,
            Entity::RemoveOkLogs(e) => serde_json::to_vec(e)?,
        })
    }
}

/// One decoded metalog record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaLogRecord {
    State(Entity),
    Removal { entity_type: u32, id: i64 },
}

pub(crate) fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

fn checksum(entity_type: u32, id: i64, timestamp: i64, flags: u32, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&entity_type.to_le_bytes());
    hasher.update(&id.to_le_bytes());
    hasher.update(&timestamp.to_le_bytes());
    hasher.update(&flags.to_le_bytes());
    hasher.update(&(payload.len() as u32).to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn frame(entity_type: u32, id: i64, timestamp: i64, flags: EntityFlags, payload: &[u8]) -> Vec<u8> {
    let crc = checksum(entity_type, id, timestamp, flags.bits(), payload);
    let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    out.extend_from_slice(&entity_type.to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.extend_from_slice(&flags.bits().to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    let header_crc = crc32fast::hash(&out[..HEADER_CHECKSUM_OFFSET]);
    out.extend_from_slice(&header_crc.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Encodes the current state of `entity`.
pub fn encode_state(entity: &Entity) -> MetaLogResult<Vec<u8>> {
    let payload = entity.encode_payload()?;
    Ok(frame(
        entity.entity_type(),
        entity.id(),
        entity.timestamp(),
        EntityFlags::empty(),
        &payload,
    ))
}

/// Encodes a tombstone for `entity`.
pub fn encode_removal(entity: &Entity) -> Vec<u8> {
    frame(
        entity.entity_type(),
        entity.id(),
        now_micros(),
        EntityFlags::REMOVE,
        &[],
    )
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_i64(buf: &[u8], at: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    i64::from_le_bytes(raw)
}

/// Result of decoding the record at the front of a buffer.
#[derive(Debug)]
pub enum Decoded {
    Record(MetaLogRecord, usize),
    /// The buffer ends inside this record
    Torn,
}

/// Decodes one record from the front of `buf`.
///
/// A record cut short by the end of `buf` is `Decoded::Torn`: either the
/// header itself is incomplete, or the header is intact and the payload it
/// declares runs past the end. Any other defect, including a header whose
/// checksum does not match, is returned as the error string.
pub fn decode_record(buf: &[u8]) -> Result<Decoded, String> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Ok(Decoded::Torn);
    }
    let stored_header_crc = read_u32(buf, HEADER_CHECKSUM_OFFSET);
    let computed_header_crc = crc32fast::hash(&buf[..HEADER_CHECKSUM_OFFSET]);
    if stored_header_crc != computed_header_crc {
        return Err(format!(
            "header checksum mismatch: stored {:#010x}, computed {:#010x}",
            stored_header_crc, computed_header_crc
        ));
    }
    let header = EntityHeader {
        entity_type: read_u32(buf, 0),
        id: read_i64(buf, 4),
        timestamp: read_i64(buf, 12),
        flags: EntityFlags::from_bits_retain(read_u32(buf, 20)),
        length: read_u32(buf, 24),
        checksum: read_u32(buf, 28),
        header_checksum: stored_header_crc,
    };
    let end = RECORD_HEADER_SIZE + header.length as usize;
    if buf.len() < end {
        return Ok(Decoded::Torn);
    }
    let payload = &buf[RECORD_HEADER_SIZE..end];
    let computed = checksum(
        header.entity_type,
        header.id,
        header.timestamp,
        header.flags.bits(),
        payload,
    );
    if computed != header.checksum {
        return Err(format!(
            "checksum mismatch for entity {}: stored {:#010x}, computed {:#010x}",
            header.id, header.checksum, computed
        ));
    }

    if header.flags.contains(EntityFlags::REMOVE) {
        return Ok(Decoded::Record(
            MetaLogRecord::Removal {
                entity_type: header.entity_type,
                id: header.id,
            },
            end,
        ));
    }

    let entity = match header.entity_type {
        ENTITY_TYPE_RANGE => {
            let mut e: RangeEntity = serde_json::from_slice(payload)
                .map_err(|e| format!("bad range entity {}: {}", header.id, e))?;
            e.id = header.id;
            e.timestamp = header.timestamp;
            Entity::Range(e)
        }
        ENTITY_TYPE_REMOVE_OK_LOGS => {
            let mut e: RemoveOkLogsEntity = serde_json::from_slice(payload)
                .map_err(|e| format!("bad remove-ok-logs entity {}: {}", header.id, e))?;
            e.id = header.id;
            e.timestamp = header.timestamp;
            Entity::RemoveOkLogs(e)
        }
        other => return Err(format!("unknown entity type {:#06x}", other)),
    };
    Ok(Decoded::Record(MetaLogRecord::State(entity), end))
}
