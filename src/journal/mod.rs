//! Journal (write-ahead log) segments.
//!
//! Every memtable generation is paired with exactly one journal segment. The
//! writer appends each committed batch to the current segment before the
//! batch becomes visible in the memtable. When the memtable is rotated out
//! the segment is closed but kept on disk: until the frozen memtable has been
//! flushed to a sorted table it is the only durable copy of those writes.
//!
//! # File Format
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|
//! +------------------+
//! | Record 1         |
//! +------------------+
//! | Record 2         |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! ## Record Format
//!
//! ```text
//! +-----------+------------------+-----------+
//! |length:u32 | payload          |crc32:u32  |
//! +-----------+------------------+-----------+
//! | 4 bytes   | variable length  | 4 bytes   |
//! +-----------+------------------+-----------+
//! ```
//!
//! The checksum is CRC-32/ISCSI over the payload. A record cut short by a
//! crash at the tail of a segment ends replay; a checksum mismatch is
//! reported as corruption.

pub mod header;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::Error;
use header::{Header, HEADER_SIZE};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Upper bound on a single record; larger lengths mean a corrupt frame.
const MAX_RECORD_SIZE: usize = 256 * 1024 * 1024;

/// A journal segment as seen by the rotation protocol.
pub trait Journal: Send + Sync {
    /// Segment id the journal was opened for.
    fn id(&self) -> u64;

    /// Appends one record.
    fn append(&mut self, record: &[u8]) -> Result<()>;

    /// Makes every appended record durable.
    fn sync(&mut self) -> Result<()>;

    /// Flushes and stops accepting records. Closing twice is a no-op.
    fn close(&mut self) -> Result<()>;
}

struct OpenSegment {
    file: File,
    writer: BufWriter<File>,
}

/// File-backed journal segment.
pub struct JournalWriter {
    id: u64,
    path: PathBuf,
    segment: Option<OpenSegment>,
    header: Header,
    // Set by the first failed write; the segment may end in a torn frame.
    failed: bool,
}

impl std::fmt::Debug for JournalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalWriter")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("records", &self.header.record_count)
            .field("closed", &self.segment.is_none())
            .field("failed", &self.failed)
            .finish()
    }
}

impl JournalWriter {
    /// Creates a new segment. Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>, id: u64, buffer_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::options()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let header = Header::new(id);
        file.write_all(&header.encode())?;
        file.sync_all()?;

        let writer = BufWriter::with_capacity(buffer_size, file.try_clone()?);

        Ok(Self {
            id,
            path,
            segment: Some(OpenSegment { file, writer }),
            header,
            failed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_count(&self) -> u64 {
        self.header.record_count
    }

    pub fn is_closed(&self) -> bool {
        self.segment.is_none()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    fn failed_error(&self) -> Error {
        Error::JournalFailed(format!("journal {} stopped after a failed write", self.id))
    }

    /// Flushes buffered records and rewrites the header with the current
    /// record count.
    fn flush_all(&mut self) -> Result<()> {
        if self.failed && self.segment.is_some() {
            return Err(self.failed_error());
        }
        let segment = self.segment.as_mut().ok_or(Error::Closed)?;
        let header = self.header.encode();
        if let Err(e) = flush_segment(segment, &header) {
            self.failed = true;
            return Err(e.into());
        }
        Ok(())
    }
}

fn flush_segment(segment: &mut OpenSegment, header: &[u8]) -> io::Result<()> {
    segment.writer.flush()?;

    // The writer shares the file offset with `file`.
    segment.file.seek(SeekFrom::Start(0))?;
    segment.file.write_all(header)?;
    segment.file.seek(SeekFrom::End(0))?;
    segment.file.sync_data()
}

fn write_frame<W: Write>(writer: &mut W, record: &[u8]) -> io::Result<()> {
    writer.write_u32::<BigEndian>(record.len() as u32)?;
    writer.write_all(record)?;
    writer.write_u32::<BigEndian>(CRC32.checksum(record))
}

impl Journal for JournalWriter {
    fn id(&self) -> u64 {
        self.id
    }

    fn append(&mut self, record: &[u8]) -> Result<()> {
        if record.len() > MAX_RECORD_SIZE {
            return Err(Error::InvalidData(format!(
                "Record of {} bytes exceeds limit",
                record.len()
            )));
        }
        if self.failed && self.segment.is_some() {
            return Err(self.failed_error());
        }
        let segment = self.segment.as_mut().ok_or(Error::Closed)?;
        if let Err(e) = write_frame(&mut segment.writer, record) {
            // Later frames would land after a partial one and be lost on
            // replay.
            self.failed = true;
            tracing::error!(journal_id = self.id, error = %e, "Journal append failed");
            return Err(e.into());
        }

        self.header.record_count += 1;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.flush_all()
    }

    fn close(&mut self) -> Result<()> {
        let Some(segment) = self.segment.take() else {
            return Ok(());
        };
        if self.failed {
            // Discard buffered bytes so nothing more follows the torn frame.
            let _ = segment.writer.into_parts();
            return Err(self.failed_error());
        }
        self.segment = Some(segment);
        self.flush_all()?;
        self.segment = None;
        tracing::debug!(
            journal_id = self.id,
            records = self.header.record_count,
            "Closed journal"
        );
        Ok(())
    }
}

/// Replays the record payloads of a journal segment in append order.
pub struct JournalReader {
    reader: BufReader<File>,
    header: Header,
    done: bool,
}

impl JournalReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path.as_ref())?;
        let mut buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::InvalidHeader,
            _ => Error::IoError(e),
        })?;
        let header = Header::decode(&buf)?;

        Ok(Self {
            reader: BufReader::new(file),
            header,
            done: false,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let len = match self.reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len > MAX_RECORD_SIZE {
            return Err(Error::InvalidData(format!(
                "Record length {} exceeds limit",
                len
            )));
        }

        let mut payload = vec![0u8; len];
        let stored_crc = match self
            .reader
            .read_exact(&mut payload)
            .and_then(|_| self.reader.read_u32::<BigEndian>())
        {
            Ok(crc) => crc,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::warn!(
                    journal_id = self.header.segment_id,
                    record_len = len,
                    "Dropping torn record at journal tail"
                );
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if CRC32.checksum(&payload) != stored_crc {
            return Err(Error::ChecksumMismatch);
        }
        Ok(Some(payload))
    }
}

impl Iterator for JournalReader {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
