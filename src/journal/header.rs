use crate::error::Result;
use crate::Error;
use byteorder::{BigEndian, ReadBytesExt};

pub const HEADER_SIZE: usize = 64;

const MAGIC: &[u8; 8] = b"EMBER\x00JL";
const VERSION: u32 = 1;

/// Fixed-size header at the start of every journal segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub magic: [u8; 8],
    pub version: u32,
    pub segment_id: u64,
    pub record_count: u64,
}

impl Header {
    pub fn new(segment_id: u64) -> Self {
        Header {
            magic: *MAGIC,
            version: VERSION,
            segment_id,
            record_count: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC {
            return Err(Error::InvalidJournalMagic);
        }
        if self.version != VERSION {
            return Err(Error::UnsupportedJournalVersion(self.version));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        buf[8..12].copy_from_slice(&self.version.to_be_bytes());
        buf[12..20].copy_from_slice(&self.segment_id.to_be_bytes());
        buf[20..28].copy_from_slice(&self.record_count.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::InvalidHeader);
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);

        let version = (&buf[8..12]).read_u32::<BigEndian>()?;
        let segment_id = (&buf[12..20]).read_u64::<BigEndian>()?;
        let record_count = (&buf[20..28]).read_u64::<BigEndian>()?;

        let header = Self {
            magic,
            version,
            segment_id,
            record_count,
        };
        header.validate()?;
        Ok(header)
    }
}
