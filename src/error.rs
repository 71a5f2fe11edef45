use std::io;
use std::sync::PoisonError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    /// Opening the journal for a freshly allocated segment failed. The
    /// segment id has already been handed back to the allocator.
    Allocation(u64, Box<Error>),
    Closed,
    /// A rotation was requested while the previous generation (frozen at the
    /// given sequence) is still waiting to be flushed.
    RotationPending(u64),
    NoFrozen,
    Poisoned,
    /// An earlier journal append or sync failed. The journal may hold a
    /// record the caller was told had failed, so the writer stops.
    JournalFailed(String),
    InvalidHeader,
    InvalidJournalMagic,
    UnsupportedJournalVersion(u32),
    ChecksumMismatch,
    InvalidData(String),
    LockError(io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::Poisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::Allocation(id, err) => {
                write!(f, "Failed to allocate journal segment {}: {}", id, err)
            }
            Error::Closed => write!(f, "Database is closed"),
            Error::RotationPending(seq) => write!(
                f,
                "Frozen memtable (sequence {}) is still pending flush",
                seq
            ),
            Error::NoFrozen => write!(f, "No frozen memtable"),
            Error::Poisoned => write!(f, "Lock was poisoned"),
            Error::JournalFailed(msg) => write!(f, "Journal failed: {}", msg),
            Error::InvalidHeader => write!(f, "Invalid header"),
            Error::InvalidJournalMagic => write!(f, "Invalid journal magic"),
            Error::UnsupportedJournalVersion(v) => {
                write!(f, "Unsupported journal version: {}", v)
            }
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) | Error::LockError(err) => Some(err),
            Error::Allocation(_, err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
