//! Write batches and their journal record encoding.
//!
//! A batch is the unit the writer commits: it is appended to the current
//! journal as a single record and then applied to the mutable memtable with
//! contiguous sequence numbers.
//!
//! ```text
//! +---------------+-----------+---------+---------+-----
//! |first_seq:u64  | count:u32 | entry 0 | entry 1 | ...
//! +---------------+-----------+---------+---------+-----
//!
//! entry: | kind:u8 | key_len:u32 | key | val_len:u32 | value |
//! ```
//!
//! All integers are big-endian. Deletions carry `val_len = 0`.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::error::Result;
use crate::memtable::Table;
use crate::Error;

const BATCH_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Delete = 0,
    Put = 1,
}

impl TryFrom<u8> for ValueKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ValueKind::Delete),
            1 => Ok(ValueKind::Put),
            other => Err(Error::InvalidData(format!("Unknown value kind {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BatchEntry {
    kind: ValueKind,
    key: Vec<u8>,
    value: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    entries: Vec<BatchEntry>,
    size: usize,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.push(ValueKind::Put, key.into(), value.into())
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.push(ValueKind::Delete, key.into(), Vec::new())
    }

    fn push(&mut self, kind: ValueKind, key: Vec<u8>, value: Vec<u8>) -> &mut Self {
        self.size += key.len() + value.len();
        self.entries.push(BatchEntry { kind, key, value });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Key and value bytes carried by the batch.
    pub fn approximate_size(&self) -> usize {
        self.size
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.size = 0;
    }

    /// Iterates over `(kind, key, value)`; `value` is `None` for deletions.
    pub fn iter(&self) -> impl Iterator<Item = (ValueKind, &[u8], Option<&[u8]>)> {
        self.entries.iter().map(|e| {
            let value = match e.kind {
                ValueKind::Put => Some(e.value.as_slice()),
                ValueKind::Delete => None,
            };
            (e.kind, e.key.as_slice(), value)
        })
    }

    /// Inserts entry `i` into `table` with sequence `first_seq + i`.
    pub fn apply_to<T: Table + ?Sized>(&self, table: &T, first_seq: u64) {
        for (i, (kind, key, value)) in self.iter().enumerate() {
            table.insert(first_seq + i as u64, kind, key, value.unwrap_or_default());
        }
    }

    pub fn encode(&self, first_seq: u64) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(BATCH_HEADER_SIZE + self.size + self.len() * 9);
        buf.write_u64::<BigEndian>(first_seq)?;
        buf.write_u32::<BigEndian>(self.entries.len() as u32)?;
        for entry in &self.entries {
            buf.write_u8(entry.kind as u8)?;
            buf.write_u32::<BigEndian>(entry.key.len() as u32)?;
            buf.extend_from_slice(&entry.key);
            buf.write_u32::<BigEndian>(entry.value.len() as u32)?;
            buf.extend_from_slice(&entry.value);
        }
        Ok(buf)
    }

    /// Decodes a journal record into its first sequence number and batch.
    pub fn decode(record: &[u8]) -> Result<(u64, Batch)> {
        if record.len() < BATCH_HEADER_SIZE {
            return Err(Error::InvalidData(format!(
                "Batch record too short: {} bytes",
                record.len()
            )));
        }

        let mut cursor = Cursor::new(record);
        let first_seq = cursor.read_u64::<BigEndian>()?;
        let count = cursor.read_u32::<BigEndian>()?;

        let mut batch = Batch::new();
        for i in 0..count {
            let kind = ValueKind::try_from(cursor.read_u8().map_err(|e| {
                Error::InvalidData(format!("Failed to read kind of entry {}: {}", i, e))
            })?)?;
            let key = read_chunk(&mut cursor, "key")?;
            let value = read_chunk(&mut cursor, "value")?;
            batch.push(kind, key, value);
        }

        if cursor.position() as usize != record.len() {
            return Err(Error::InvalidData(format!(
                "Trailing bytes after {} batch entries",
                count
            )));
        }

        Ok((first_seq, batch))
    }
}

fn read_chunk(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<Vec<u8>> {
    let len = cursor
        .read_u32::<BigEndian>()
        .map_err(|e| Error::InvalidData(format!("Failed to read {} length: {}", what, e)))?
        as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(Error::InvalidData(format!(
            "{} length {} exceeds record ({} bytes left)",
            what, len, remaining
        )));
    }
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}
