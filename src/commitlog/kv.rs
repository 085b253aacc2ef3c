//! Cell key/value pairs carried in commit-log blocks
//!
//! Wire layout (little-endian):
//!
//! ```text
//! row_len:u32 | row | column_len:u32 | column | timestamp:i64 | revision:i64 | value_len:u32 | value
//! ```

use serde::{Deserialize, Serialize};

use super::errors::{CommitLogError, CommitLogResult};

/// Cell address plus the revision that wrote it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    pub row: String,
    pub column: String,
    pub timestamp: i64,
    pub revision: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Key,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(
        row: impl Into<String>,
        column: impl Into<String>,
        timestamp: i64,
        revision: i64,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            key: Key {
                row: row.into(),
                column: column.into(),
                timestamp,
                revision,
            },
            value: value.into(),
        }
    }

    pub fn row(&self) -> &str {
        &self.key.row
    }

    /// Bytes this pair occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        4 + self.key.row.len() + 4 + self.key.column.len() + 8 + 8 + 4 + self.value.len()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, self.key.row.as_bytes());
        put_bytes(buf, self.key.column.as_bytes());
        buf.extend_from_slice(&self.key.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.key.revision.to_le_bytes());
        put_bytes(buf, &self.value);
    }

    pub fn decode_from(cursor: &mut ByteCursor<'_>) -> CommitLogResult<Self> {
        let row = cursor.read_string()?;
        let column = cursor.read_string()?;
        let timestamp = cursor.read_i64()?;
        let revision = cursor.read_i64()?;
        let value = cursor.read_bytes()?.to_vec();
        Ok(Self {
            key: Key {
                row,
                column,
                timestamp,
                revision,
            },
            value,
        })
    }
}

/// Appends a u32 length prefix and the bytes.
pub(crate) fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

/// Bounds-checked reader over an encoded buffer.
pub struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> CommitLogResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CommitLogError::codec(format!(
                "need {} bytes at offset {}, {} remaining",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u32(&mut self) -> CommitLogResult<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    pub fn read_u64(&mut self) -> CommitLogResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_i64(&mut self) -> CommitLogResult<i64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(raw))
    }

    pub fn read_bytes(&mut self) -> CommitLogResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    pub fn read_string(&mut self) -> CommitLogResult<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CommitLogError::codec(format!("invalid UTF-8: {}", e)))
    }
}
