//! Segment-id allocation and journal file management.
//!
//! The rotation protocol never touches the file system directly. It asks a
//! `Storage` for a fresh segment id, opens a journal for it, hands the id
//! back when that open fails, and asks for the frozen journal to be deleted
//! once its memtable has been flushed.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::DbConfig;
use crate::error::Result;
use crate::flock::FileLock;
use crate::journal::{Journal, JournalWriter};
use crate::Error;

const LOCK_FILE: &str = "LOCK";
const JOURNAL_EXT: &str = "log";

/// Storage collaborator used by the rotation protocol.
pub trait Storage: Send + Sync {
    type Journal: Journal;

    /// Reserves a new segment id.
    fn allocate_segment_id(&self) -> u64;

    /// Returns an id reserved by `allocate_segment_id` that was never used.
    fn release_segment_id(&self, id: u64);

    /// Creates the journal for a freshly allocated segment.
    fn open_journal(&self, id: u64) -> Result<Self::Journal>;

    /// Removes a closed journal segment.
    fn delete_journal(&self, journal: &Self::Journal) -> Result<()>;
}

/// Journal segments stored as `NNNNNN.log` files in one locked directory.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    next_id: AtomicU64,
    journal_buffer_size: usize,
    _lock: FileLock,
}

impl FileStorage {
    /// Opens (creating if needed) and locks the storage directory.
    ///
    /// Segment ids resume past the highest journal found on disk so a
    /// restart never reuses the id of a segment that still exists.
    pub fn open(config: &DbConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let lock = FileLock::lock(config.dir.join(LOCK_FILE)).map_err(Error::LockError)?;

        let existing = list_journal_ids(&config.dir)?;
        let next_id = existing.last().map_or(1, |id| id + 1);

        tracing::info!(
            dir = %config.dir.display(),
            journals = existing.len(),
            next_segment_id = next_id,
            "Opened journal storage"
        );

        Ok(Self {
            dir: config.dir.clone(),
            next_id: AtomicU64::new(next_id),
            journal_buffer_size: config.journal_buffer_size,
            _lock: lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn journal_path(&self, id: u64) -> PathBuf {
        journal_path(&self.dir, id)
    }

    /// Id the next `allocate_segment_id` call will return.
    pub fn next_segment_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Journal segment ids present on disk, ascending.
    pub fn journal_ids(&self) -> Result<Vec<u64>> {
        list_journal_ids(&self.dir)
    }
}

impl Storage for FileStorage {
    type Journal = JournalWriter;

    fn allocate_segment_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn release_segment_id(&self, id: u64) {
        // Only the most recent allocation can be handed back.
        let reused = self
            .next_id
            .compare_exchange(id + 1, id, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        tracing::debug!(segment_id = id, reused, "Released segment id");
    }

    fn open_journal(&self, id: u64) -> Result<JournalWriter> {
        JournalWriter::create(self.journal_path(id), id, self.journal_buffer_size)
    }

    fn delete_journal(&self, journal: &JournalWriter) -> Result<()> {
        fs::remove_file(journal.path())?;
        tracing::info!(journal_id = journal.id(), "Deleted journal");
        Ok(())
    }
}

fn journal_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:06}.{}", id, JOURNAL_EXT))
}

fn list_journal_ids(dir: &Path) -> Result<Vec<u64>> {
    let mut ids: Vec<u64> = fs::read_dir(dir)?
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            if path.extension()?.to_str()? != JOURNAL_EXT {
                return None;
            }
            path.file_stem()?.to_str()?.parse::<u64>().ok()
        })
        .collect();
    ids.sort_unstable();
    Ok(ids)
}
