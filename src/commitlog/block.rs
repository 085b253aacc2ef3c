//! Commit-log block format
//!
//! Every block is a fixed header followed by `length` bytes of payload:
//!
//! ```text
//! magic:u32 | revision:i64 | cluster_id:u64 | length:u32 | checksum:u32 | payload
//! ```
//!
//! The checksum is CRC32 over the first four header fields and the payload.
//! DATA payloads carry a table identifier and its key/value pairs; LINK
//! payloads carry the directory of another commit log whose fragments are
//! spliced in at this position.

use std::path::PathBuf;

use crc32fast::Hasher;

use crate::range::TableIdentifier;

use super::errors::{CommitLogError, CommitLogResult};
use super::kv::{put_bytes, ByteCursor, KeyValue};

/// Magic for blocks carrying table mutations.
pub const DATA_MAGIC: u32 = 0x4154_4144; // "DATA"
/// Magic for blocks linking another log.
pub const LINK_MAGIC: u32 = 0x4B4E_494C; // "LINK"

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 4 + 8 + 8 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub magic: u32,
    pub revision: i64,
    pub cluster_id: u64,
    pub length: u32,
    pub checksum: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockBody {
    Data {
        table: TableIdentifier,
        pairs: Vec<KeyValue>,
    },
    Link {
        dir: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

fn checksum(magic: u32, revision: i64, cluster_id: u64, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&magic.to_le_bytes());
    hasher.update(&revision.to_le_bytes());
    hasher.update(&cluster_id.to_le_bytes());
    hasher.update(&(payload.len() as u32).to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn frame(magic: u32, revision: i64, cluster_id: u64, payload: Vec<u8>) -> Vec<u8> {
    let crc = checksum(magic, revision, cluster_id, &payload);
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&magic.to_le_bytes());
    out.extend_from_slice(&revision.to_le_bytes());
    out.extend_from_slice(&cluster_id.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

/// Encodes a DATA block for one table.
pub fn encode_data_block(
    cluster_id: u64,
    revision: i64,
    table: &TableIdentifier,
    pairs: &[KeyValue],
) -> Vec<u8> {
    let body_len: usize = pairs.iter().map(KeyValue::encoded_len).sum();
    let mut payload = Vec::with_capacity(4 + table.id.len() + 8 + 4 + body_len);
    put_bytes(&mut payload, table.id.as_bytes());
    payload.extend_from_slice(&table.generation.to_le_bytes());
    payload.extend_from_slice(&(pairs.len() as u32).to_le_bytes());
    for kv in pairs {
        kv.encode_into(&mut payload);
    }
    frame(DATA_MAGIC, revision, cluster_id, payload)
}

/// Encodes a LINK block naming `dir`.
pub fn encode_link_block(cluster_id: u64, revision: i64, dir: &std::path::Path) -> Vec<u8> {
    let mut payload = Vec::new();
    put_bytes(&mut payload, dir.to_string_lossy().as_bytes());
    frame(LINK_MAGIC, revision, cluster_id, payload)
}

/// Decodes one block from the front of `buf`.
///
/// Returns the block and the number of bytes consumed. Any structural
/// problem, including a block cut short by the end of the buffer, is a
/// codec error.
pub fn decode_block(buf: &[u8]) -> CommitLogResult<(Block, usize)> {
    let mut cursor = ByteCursor::new(buf);
    if cursor.remaining() < HEADER_SIZE {
        return Err(CommitLogError::codec(format!(
            "truncated block header: {} bytes",
            cursor.remaining()
        )));
    }

    let magic = cursor.read_u32()?;
    let revision = cursor.read_i64()?;
    let cluster_id = cursor.read_u64()?;
    let length = cursor.read_u32()?;
    let stored_checksum = cursor.read_u32()?;

    if magic != DATA_MAGIC && magic != LINK_MAGIC {
        return Err(CommitLogError::codec(format!("bad block magic {:#010x}", magic)));
    }
    if cursor.remaining() < length as usize {
        return Err(CommitLogError::codec(format!(
            "block length {} exceeds remaining {} bytes",
            length,
            cursor.remaining()
        )));
    }

    let payload = &buf[HEADER_SIZE..HEADER_SIZE + length as usize];
    let computed = checksum(magic, revision, cluster_id, payload);
    if computed != stored_checksum {
        return Err(CommitLogError::codec(format!(
            "checksum mismatch: stored {:#010x}, computed {:#010x}",
            stored_checksum, computed
        )));
    }

    let mut body_cursor = ByteCursor::new(payload);
    let body = if magic == DATA_MAGIC {
        let id = body_cursor.read_string()?;
        let generation = body_cursor.read_i64()?;
        let count = body_cursor.read_u32()?;
        let mut pairs = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            pairs.push(KeyValue::decode_from(&mut body_cursor)?);
        }
        BlockBody::Data {
            table: TableIdentifier::new(id, generation),
            pairs,
        }
    } else {
        BlockBody::Link {
            dir: PathBuf::from(body_cursor.read_string()?),
        }
    };
    if body_cursor.remaining() != 0 {
        return Err(CommitLogError::codec(format!(
            "{} trailing bytes in block payload",
            body_cursor.remaining()
        )));
    }

    let header = BlockHeader {
        magic,
        revision,
        cluster_id,
        length,
        checksum: stored_checksum,
    };
    Ok((Block { header, body }, HEADER_SIZE + length as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pairs() -> Vec<KeyValue> {
        vec![
            KeyValue::new("a", "cf:x", 1, 100, b"1".to_vec()),
            KeyValue::new("b", "cf:x", 2, 101, b"2".to_vec()),
        ]
    }

    #[test]
    fn test_data_block_decodes_to_same_pairs() {
        let table = TableIdentifier::new("3", 2);
        let bytes = encode_data_block(7, 101, &table, &sample_pairs());
        let (block, used) = decode_block(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(block.header.cluster_id, 7);
        assert_eq!(block.header.revision, 101);
        match block.body {
            BlockBody::Data { table: t, pairs } => {
                assert_eq!(t, table);
                assert_eq!(pairs, sample_pairs());
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_link_block_carries_dir() {
        let bytes = encode_link_block(1, 5, std::path::Path::new("/log/phantom/3/x"));
        let (block, _) = decode_block(&bytes).unwrap();
        assert_eq!(block.header.magic, LINK_MAGIC);
        assert_eq!(
            block.body,
            BlockBody::Link {
                dir: PathBuf::from("/log/phantom/3/x")
            }
        );
    }

    #[test]
    fn test_flipped_payload_bit_fails_checksum() {
        let table = TableIdentifier::new("3", 1);
        let mut bytes = encode_data_block(1, 1, &table, &sample_pairs());
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let err = decode_block(&bytes).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_truncated_block_is_rejected() {
        let table = TableIdentifier::new("3", 1);
        let bytes = encode_data_block(1, 1, &table, &sample_pairs());
        assert!(decode_block(&bytes[..bytes.len() - 3]).is_err());
        assert!(decode_block(&bytes[..10]).is_err());
    }

    #[test]
    fn test_consecutive_blocks_decode_in_sequence() {
        let table = TableIdentifier::new("3", 1);
        let mut bytes = encode_data_block(1, 1, &table, &sample_pairs());
        bytes.extend(encode_link_block(1, 2, std::path::Path::new("/other")));

        let (_, first) = decode_block(&bytes).unwrap();
        let (second, used) = decode_block(&bytes[first..]).unwrap();
        assert_eq!(first + used, bytes.len());
        assert!(matches!(second.body, BlockBody::Link { .. }));
    }
}
