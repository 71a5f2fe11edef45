//! Write-path state: memtable generations, journal rotation, sequence
//! numbers and the closed latch.
//!
//! # Generations
//!
//! ```text
//!            begin_rotation                 release_frozen
//! NoFrozen ─────────────────► Frozen ─────────────────────► NoFrozen
//! (mem, journal)              (mem, journal,                (mem, journal)
//!                              frozen table, frozen journal,
//!                              boundary)
//! ```
//!
//! At most one generation is in flight to disk. Rotating demotes the mutable
//! memtable and its journal to the frozen generation, records the sequence
//! boundary (every write with sequence `<= boundary` lives in the frozen
//! table) and installs a fresh memtable and journal. The frozen journal stays
//! on disk until the flush path calls `release_frozen`.
//!
//! # Handles
//!
//! - `DbState` is shared (`Arc`) by readers, iterators and the flush path.
//!   Table-pair observations take the read side of one `RwLock`; rotation and
//!   release take the write side only for the pointer swap.
//! - `MemWriter` is the single writer's capability. There is exactly one per
//!   opened state and it is not `Clone`. Only it can rotate, advance the
//!   sequence counter, append to the current journal, and read the table
//!   pair without taking the lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::batch::Batch;
use crate::closed::ClosedFlag;
use crate::config::DbConfig;
use crate::error::Result;
use crate::journal::Journal;
use crate::memtable::{Table, TableFactory};
use crate::seq::SequenceCounter;
use crate::storage::Storage;
use crate::Error;

/// Mutable memtable and, while a flush is pending, the frozen one.
pub struct Tables<T> {
    pub mem: Arc<T>,
    pub frozen: Option<Arc<T>>,
}

impl<T> Clone for Tables<T> {
    fn clone(&self) -> Self {
        Self {
            mem: Arc::clone(&self.mem),
            frozen: self.frozen.clone(),
        }
    }
}

/// The generation waiting to be flushed.
struct FrozenGeneration<T, J> {
    table: Arc<T>,
    journal: J,
    boundary: u64,
}

struct MemState<T, J> {
    mem: Arc<T>,
    frozen: Option<FrozenGeneration<T, J>>,
}

/// Metrics snapshot of the write-path state
#[derive(Debug, Clone, PartialEq)]
pub struct StateMetrics {
    pub mutable_size: usize,
    pub mutable_capacity: usize,
    pub mutable_entries: usize,
    pub frozen_size: Option<usize>,
    pub frozen_boundary: Option<u64>,
    pub frozen_journal_id: Option<u64>,
    pub sequence: u64,
    pub rotations: u64,
    pub closed: bool,
}

/// Shared handle to the write-path state.
pub struct DbState<S: Storage, F: TableFactory> {
    config: DbConfig,
    storage: S,
    factory: F,
    seq: SequenceCounter,
    closed: ClosedFlag,
    // Mirrors `mem.frozen.is_some()`; written only under the write lock.
    frozen_pending: AtomicBool,
    rotations: AtomicU64,
    mem: RwLock<MemState<F::Table, S::Journal>>,
}

impl<S: Storage, F: TableFactory> DbState<S, F> {
    /// Opens the state with an empty memtable, a fresh journal and a zero
    /// sequence counter.
    pub fn open(storage: S, factory: F, config: DbConfig) -> Result<(Arc<Self>, MemWriter<S, F>)> {
        Self::open_at(storage, factory, config, 0)
    }

    /// Like `open`, resuming the sequence counter at `last_sequence`.
    pub fn open_at(
        storage: S,
        factory: F,
        config: DbConfig,
        last_sequence: u64,
    ) -> Result<(Arc<Self>, MemWriter<S, F>)> {
        let journal = open_segment(&storage)?;
        let mem = Arc::new(factory.new_table(config.table_capacity()));

        tracing::info!(
            journal_id = journal.id(),
            table_capacity = mem.capacity(),
            sequence = last_sequence,
            "Opened write-path state"
        );

        let state = Arc::new(Self {
            config,
            storage,
            factory,
            seq: SequenceCounter::new(last_sequence),
            closed: ClosedFlag::new(),
            frozen_pending: AtomicBool::new(false),
            rotations: AtomicU64::new(0),
            mem: RwLock::new(MemState {
                mem: Arc::clone(&mem),
                frozen: None,
            }),
        });

        let writer = MemWriter {
            state: Arc::clone(&state),
            journal,
            mem,
            frozen: None,
            failed: None,
        };
        Ok((state, writer))
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Last committed sequence number. Lock-free.
    pub fn current_sequence(&self) -> u64 {
        self.seq.current()
    }

    /// Returns true only for the call that closed the state.
    pub fn mark_closed(&self) -> bool {
        let closed = self.closed.mark_closed();
        if closed {
            tracing::info!(sequence = self.current_sequence(), "Marked closed");
        }
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    pub fn check_open(&self) -> Result<()> {
        self.closed.check_open()
    }

    /// Consistent (mutable, frozen) pair.
    pub fn tables(&self) -> Result<Tables<F::Table>> {
        self.check_open()?;
        let state = self.mem.read()?;
        Ok(Tables {
            mem: Arc::clone(&state.mem),
            frozen: state.frozen.as_ref().map(|f| Arc::clone(&f.table)),
        })
    }

    /// Whether a frozen generation is waiting to be flushed.
    pub fn has_frozen(&self) -> bool {
        self.mem
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .frozen
            .is_some()
    }

    /// The frozen memtable, or `NoFrozen` if none is pending.
    pub fn frozen_table(&self) -> Result<Arc<F::Table>> {
        self.check_open()?;
        let state = self.mem.read()?;
        state
            .frozen
            .as_ref()
            .map(|f| Arc::clone(&f.table))
            .ok_or(Error::NoFrozen)
    }

    /// Sequence number recorded when the pending generation was frozen.
    pub fn frozen_boundary(&self) -> Result<u64> {
        let state = self.mem.read()?;
        state
            .frozen
            .as_ref()
            .map(|f| f.boundary)
            .ok_or(Error::NoFrozen)
    }

    /// Drops the frozen generation once the flush path has persisted it,
    /// deleting its journal segment.
    ///
    /// If the segment cannot be deleted the error is returned and the
    /// generation stays pending, so the call can be retried.
    pub fn release_frozen(&self) -> Result<()> {
        let mut state = self.mem.write()?;
        let frozen = state.frozen.as_ref().ok_or(Error::NoFrozen)?;
        let journal_id = frozen.journal.id();
        let boundary = frozen.boundary;

        if let Err(e) = self.storage.delete_journal(&frozen.journal) {
            tracing::error!(
                journal_id = journal_id,
                error = %e,
                "Failed to delete frozen journal"
            );
            return Err(e);
        }

        state.frozen = None;
        self.frozen_pending.store(false, Ordering::Release);
        drop(state);

        tracing::info!(
            journal_id = journal_id,
            boundary = boundary,
            "Released frozen memtable"
        );
        Ok(())
    }

    /// Looks `key` up in the memtables at the current sequence.
    ///
    /// `Ok(None)` means neither memtable knows the key and the sorted tables
    /// must be consulted; `Ok(Some(None))` is a deletion.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<Option<Vec<u8>>>> {
        let seq = self.current_sequence();
        let tables = self.tables()?;

        if let Some(value) = tables.mem.get(key, seq) {
            return Ok(Some(value));
        }
        Ok(tables.frozen.and_then(|frozen| frozen.get(key, seq)))
    }

    /// Snapshot of the state, also logged.
    pub fn collect_metrics(&self) -> Result<StateMetrics> {
        let metrics = {
            let state = self.mem.read()?;
            StateMetrics {
                mutable_size: state.mem.approximate_size(),
                mutable_capacity: state.mem.capacity(),
                mutable_entries: state.mem.len(),
                frozen_size: state.frozen.as_ref().map(|f| f.table.approximate_size()),
                frozen_boundary: state.frozen.as_ref().map(|f| f.boundary),
                frozen_journal_id: state.frozen.as_ref().map(|f| f.journal.id()),
                sequence: self.current_sequence(),
                rotations: self.rotations.load(Ordering::Relaxed),
                closed: self.is_closed(),
            }
        };

        tracing::info!(
            mutable_size = metrics.mutable_size,
            mutable_capacity = metrics.mutable_capacity,
            mutable_entries = metrics.mutable_entries,
            frozen_size = ?metrics.frozen_size,
            frozen_boundary = ?metrics.frozen_boundary,
            sequence = metrics.sequence,
            rotations = metrics.rotations,
            closed = metrics.closed,
            "Write-path metrics"
        );

        Ok(metrics)
    }
}

/// Allocates a segment id and opens its journal, handing the id back if the
/// open fails.
fn open_segment<S: Storage>(storage: &S) -> Result<S::Journal> {
    let id = storage.allocate_segment_id();
    match storage.open_journal(id) {
        Ok(journal) => Ok(journal),
        Err(e) => {
            storage.release_segment_id(id);
            tracing::warn!(segment_id = id, error = %e, "Failed to open journal");
            Err(Error::Allocation(id, Box::new(e)))
        }
    }
}

/// The single writer's handle.
pub struct MemWriter<S: Storage, F: TableFactory> {
    state: Arc<DbState<S, F>>,
    journal: S::Journal,
    mem: Arc<F::Table>,
    // Last generation this writer froze; only trusted while
    // `frozen_pending` is set.
    frozen: Option<Arc<F::Table>>,
    // Cause of the first failed journal append or sync.
    failed: Option<String>,
}

impl<S: Storage, F: TableFactory> MemWriter<S, F> {
    pub fn state(&self) -> &Arc<DbState<S, F>> {
        &self.state
    }

    /// Id of the journal receiving the current generation's writes.
    pub fn journal_id(&self) -> u64 {
        self.journal.id()
    }

    /// The (mutable, frozen) pair without taking the state lock.
    pub fn current_tables(&self) -> Tables<F::Table> {
        let frozen = if self.state.frozen_pending.load(Ordering::Acquire) {
            self.frozen.clone()
        } else {
            None
        };
        Tables {
            mem: Arc::clone(&self.mem),
            frozen,
        }
    }

    /// Publishes `delta` sequence numbers.
    pub fn advance_sequence(&self, delta: u64) {
        self.state.seq.advance(delta);
    }

    /// Whether the mutable memtable has used up its budget.
    pub fn needs_rotation(&self) -> bool {
        self.mem.is_full()
    }

    /// Freezes the mutable memtable and its journal and installs fresh ones.
    ///
    /// Fails with `RotationPending` while the previous generation has not been
    /// released, and with `Allocation` if the new journal cannot be opened; in
    /// both cases nothing changes.
    pub fn begin_rotation(&mut self) -> Result<Arc<F::Table>> {
        self.state.check_open()?;
        self.check_journal()?;
        match self.state.frozen_boundary() {
            Ok(boundary) => return Err(Error::RotationPending(boundary)),
            Err(Error::NoFrozen) => {}
            Err(e) => return Err(e),
        }

        let journal = open_segment(&self.state.storage)?;
        let table = Arc::new(self.state.factory.new_table(self.state.config.table_capacity()));

        let mut state = match self.state.mem.write() {
            Ok(state) => state,
            Err(_) => {
                self.abandon(journal);
                return Err(Error::Poisoned);
            }
        };
        if let Some(boundary) = state.frozen.as_ref().map(|f| f.boundary) {
            drop(state);
            self.abandon(journal);
            return Err(Error::RotationPending(boundary));
        }
        if let Err(e) = self.journal.close() {
            drop(state);
            self.abandon(journal);
            return Err(self.fail(e));
        }

        let old_journal = std::mem::replace(&mut self.journal, journal);
        let old_journal_id = old_journal.id();
        let old_mem = std::mem::replace(&mut state.mem, Arc::clone(&table));
        // The sequence only moves under this writer, so it cannot change
        // while the swap is in progress.
        let boundary = self.state.seq.current();
        state.frozen = Some(FrozenGeneration {
            table: Arc::clone(&old_mem),
            journal: old_journal,
            boundary,
        });
        self.state.frozen_pending.store(true, Ordering::Release);
        drop(state);

        self.frozen = Some(old_mem);
        self.mem = Arc::clone(&table);
        self.state.rotations.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            frozen_journal_id = old_journal_id,
            journal_id = self.journal.id(),
            boundary = boundary,
            table_capacity = table.capacity(),
            "Rotated memtable"
        );

        Ok(table)
    }

    /// Journals `batch`, applies it to the mutable memtable and publishes its
    /// sequence numbers. Returns the last sequence number of the batch.
    ///
    /// A failed append or sync stops the writer: the record may already be in
    /// the journal, so every later `write`, `sync` and `begin_rotation` fails
    /// with `JournalFailed` instead of reusing its sequence numbers.
    pub fn write(&mut self, batch: &Batch) -> Result<u64> {
        self.state.check_open()?;
        self.check_journal()?;
        if !self.state.frozen_pending.load(Ordering::Acquire) {
            self.frozen = None;
        }

        let last = self.state.current_sequence();
        if batch.is_empty() {
            return Ok(last);
        }
        let first = last + 1;
        let record = batch.encode(first)?;

        if let Err(e) = self.journal.append(&record) {
            return Err(self.fail(e));
        }
        if self.state.config.sync_writes {
            if let Err(e) = self.journal.sync() {
                return Err(self.fail(e));
            }
        }

        batch.apply_to(self.mem.as_ref(), first);
        self.advance_sequence(batch.len() as u64);

        Ok(last + batch.len() as u64)
    }

    /// Makes every journaled write durable.
    pub fn sync(&mut self) -> Result<()> {
        self.check_journal()?;
        if let Err(e) = self.journal.sync() {
            return Err(self.fail(e));
        }
        Ok(())
    }

    /// Marks the state closed and closes the current journal.
    pub fn close(mut self) -> Result<()> {
        let first = self.state.mark_closed();
        self.journal.close()?;
        tracing::info!(
            journal_id = self.journal.id(),
            sequence = self.state.current_sequence(),
            already_closed = !first,
            "Closed writer"
        );
        Ok(())
    }

    fn check_journal(&self) -> Result<()> {
        match &self.failed {
            Some(cause) => Err(Error::JournalFailed(cause.clone())),
            None => Ok(()),
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        tracing::error!(
            journal_id = self.journal.id(),
            sequence = self.state.current_sequence(),
            error = %err,
            "Journal failed, stopping writer"
        );
        self.failed = Some(err.to_string());
        err
    }

    /// Rolls back a journal opened for a rotation that did not happen.
    fn abandon(&self, mut journal: S::Journal) {
        let id = journal.id();
        if let Err(e) = journal.close() {
            tracing::warn!(segment_id = id, error = %e, "Failed to close abandoned journal");
        }
        if let Err(e) = self.state.storage.delete_journal(&journal) {
            tracing::warn!(segment_id = id, error = %e, "Failed to delete abandoned journal");
        }
        self.state.storage.release_segment_id(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::{Memtable, SkipListFactory};
    use crate::storage::FileStorage;
    use crate::{batch::ValueKind, journal::JournalReader};
    use std::sync::{Barrier, Mutex};
    use std::thread;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct MockJournal {
        id: u64,
        records: Vec<Vec<u8>>,
        closed: bool,
        syncs: usize,
        fail_append: bool,
        fail_sync: bool,
        fail_close: bool,
    }

    fn io_error(msg: &str) -> Error {
        Error::IoError(std::io::Error::new(std::io::ErrorKind::Other, msg))
    }

    impl Journal for MockJournal {
        fn id(&self) -> u64 {
            self.id
        }

        fn append(&mut self, record: &[u8]) -> Result<()> {
            if self.closed {
                return Err(Error::Closed);
            }
            self.records.push(record.to_vec());
            if self.fail_append {
                // Partially written frame.
                return Err(io_error("short write"));
            }
            Ok(())
        }

        fn sync(&mut self) -> Result<()> {
            if self.fail_sync {
                return Err(io_error("fsync failed"));
            }
            self.syncs += 1;
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            if self.fail_close {
                return Err(io_error("flush failed"));
            }
            self.closed = true;
            Ok(())
        }
    }

    #[derive(Debug)]
    struct MockStorage {
        next_id: AtomicU64,
        fail_open: AtomicBool,
        fail_delete: AtomicBool,
        fail_journal_close: AtomicBool,
        opened: Mutex<Vec<u64>>,
        released: Mutex<Vec<u64>>,
        deleted: Mutex<Vec<u64>>,
    }

    impl Default for MockStorage {
        fn default() -> Self {
            Self {
                next_id: AtomicU64::new(1),
                fail_open: AtomicBool::new(false),
                fail_delete: AtomicBool::new(false),
                fail_journal_close: AtomicBool::new(false),
                opened: Mutex::new(Vec::new()),
                released: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
            }
        }
    }

    impl Storage for MockStorage {
        type Journal = MockJournal;

        fn allocate_segment_id(&self) -> u64 {
            self.next_id.fetch_add(1, Ordering::SeqCst)
        }

        fn release_segment_id(&self, id: u64) {
            self.released.lock().unwrap().push(id);
            let _ = self
                .next_id
                .compare_exchange(id + 1, id, Ordering::SeqCst, Ordering::SeqCst);
        }

        fn open_journal(&self, id: u64) -> Result<MockJournal> {
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(Error::IoError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.opened.lock().unwrap().push(id);
            Ok(MockJournal {
                id,
                fail_close: self.fail_journal_close.load(Ordering::SeqCst),
                ..Default::default()
            })
        }

        fn delete_journal(&self, journal: &MockJournal) -> Result<()> {
            if self.fail_delete.load(Ordering::SeqCst) {
                return Err(Error::IoError(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "read-only file system",
                )));
            }
            assert!(
                journal.closed || journal.fail_close,
                "deleting a journal that is still open"
            );
            self.deleted.lock().unwrap().push(journal.id);
            Ok(())
        }
    }

    type MockState = DbState<MockStorage, SkipListFactory>;
    type MockWriter = MemWriter<MockStorage, SkipListFactory>;

    fn open_mock(config: DbConfig) -> (Arc<MockState>, MockWriter) {
        DbState::open(MockStorage::default(), SkipListFactory, config).expect("Failed to open")
    }

    fn open_default() -> (Arc<MockState>, MockWriter) {
        open_mock(DbConfig::new("/unused").write_buffer_size(64 * 1024))
    }

    fn put(writer: &mut MockWriter, key: &str, value: &str) -> u64 {
        let mut batch = Batch::new();
        batch.put(key.as_bytes(), value.as_bytes());
        writer.write(&batch).expect("Write failed")
    }

    #[test]
    fn test_open_state() {
        let (state, writer) = open_default();

        assert!(!state.has_frozen());
        assert!(!state.is_closed());
        assert_eq!(state.current_sequence(), 0);
        assert_eq!(writer.journal_id(), 1);
        assert_eq!(*state.storage().opened.lock().unwrap(), vec![1]);

        let tables = state.tables().unwrap();
        assert!(tables.mem.is_empty());
        assert!(tables.frozen.is_none());
        assert!(matches!(state.frozen_table(), Err(Error::NoFrozen)));
        assert!(matches!(state.frozen_boundary(), Err(Error::NoFrozen)));
    }

    #[test]
    fn test_open_allocation_failure() {
        let storage = MockStorage::default();
        storage.fail_open.store(true, Ordering::SeqCst);

        let result = DbState::open(storage, SkipListFactory, DbConfig::default());
        assert!(matches!(result, Err(Error::Allocation(1, _))));
    }

    #[test]
    fn test_rotation_freezes_previous_table() {
        let (state, mut writer) = open_default();
        put(&mut writer, "key1", "value1");
        let before = state.tables().unwrap().mem;

        let new_mem = writer.begin_rotation().expect("Rotation failed");

        assert!(state.has_frozen());
        let frozen = state.frozen_table().unwrap();
        assert!(Arc::ptr_eq(&frozen, &before));
        assert!(!Arc::ptr_eq(&new_mem, &frozen));
        assert!(new_mem.is_empty());

        let tables = state.tables().unwrap();
        assert!(Arc::ptr_eq(&tables.mem, &new_mem));
        assert!(Arc::ptr_eq(tables.frozen.as_ref().unwrap(), &before));

        assert_eq!(writer.journal_id(), 2);
        assert_eq!(state.collect_metrics().unwrap().frozen_journal_id, Some(1));
    }

    #[test]
    fn test_rotation_records_boundary_without_moving_sequence() {
        let (state, mut writer) = open_default();
        put(&mut writer, "a", "1");
        put(&mut writer, "b", "2");
        let seq = state.current_sequence();
        assert_eq!(seq, 2);

        writer.begin_rotation().unwrap();

        assert_eq!(state.current_sequence(), seq);
        assert_eq!(state.frozen_boundary().unwrap(), seq);

        // New writes continue after the boundary and land in the new table.
        assert_eq!(put(&mut writer, "c", "3"), seq + 1);
        let tables = state.tables().unwrap();
        assert!(tables.mem.get(b"c", u64::MAX).is_some());
        assert!(tables.frozen.unwrap().get(b"c", u64::MAX).is_none());
    }

    #[test]
    fn test_release_frozen_deletes_journal_once() {
        let (state, mut writer) = open_default();
        writer.begin_rotation().unwrap();

        state.release_frozen().expect("Release failed");

        assert!(!state.has_frozen());
        assert!(matches!(state.frozen_table(), Err(Error::NoFrozen)));
        assert_eq!(*state.storage().deleted.lock().unwrap(), vec![1]);

        assert!(matches!(state.release_frozen(), Err(Error::NoFrozen)));
        assert_eq!(state.storage().deleted.lock().unwrap().len(), 1);

        // A new generation can be frozen again.
        writer.begin_rotation().unwrap();
        state.release_frozen().unwrap();
        assert_eq!(*state.storage().deleted.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_release_failure_keeps_generation_pending() {
        let (state, mut writer) = open_default();
        writer.begin_rotation().unwrap();

        state.storage().fail_delete.store(true, Ordering::SeqCst);
        assert!(matches!(state.release_frozen(), Err(Error::IoError(_))));
        assert!(state.has_frozen());
        assert!(state.storage().deleted.lock().unwrap().is_empty());

        state.storage().fail_delete.store(false, Ordering::SeqCst);
        state.release_frozen().unwrap();
        assert!(!state.has_frozen());
        assert_eq!(*state.storage().deleted.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_new_table_capacity_from_write_buffer() {
        let (state, mut writer) = open_mock(
            DbConfig::new("/unused")
                .write_buffer_size(64 * 1024)
                .write_buffer_percent(50),
        );
        assert_eq!(state.tables().unwrap().mem.capacity(), 32 * 1024);

        let mem = writer.begin_rotation().unwrap();
        assert_eq!(mem.capacity(), 32 * 1024);
    }

    #[test]
    fn test_allocation_failure_rolls_back() {
        let (state, mut writer) = open_default();
        put(&mut writer, "key", "value");
        let before = state.tables().unwrap().mem;

        state.storage().fail_open.store(true, Ordering::SeqCst);
        let result = writer.begin_rotation();

        assert!(matches!(result, Err(Error::Allocation(2, _))));
        assert!(!state.has_frozen());
        assert_eq!(*state.storage().released.lock().unwrap(), vec![2]);
        assert!(Arc::ptr_eq(&state.tables().unwrap().mem, &before));
        assert_eq!(writer.journal_id(), 1);

        // The writer keeps journaling to the old segment.
        put(&mut writer, "key2", "value2");

        // The released id is handed out again on retry.
        state.storage().fail_open.store(false, Ordering::SeqCst);
        writer.begin_rotation().unwrap();
        assert_eq!(writer.journal_id(), 2);
        assert_eq!(state.storage().released.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_rotation_while_frozen_pending() {
        let (state, mut writer) = open_default();
        put(&mut writer, "key", "value");
        writer.begin_rotation().unwrap();
        put(&mut writer, "key2", "value2");

        let opened = state.storage().opened.lock().unwrap().len();
        let mem = state.tables().unwrap().mem;

        assert!(matches!(
            writer.begin_rotation(),
            Err(Error::RotationPending(1))
        ));
        assert_eq!(state.storage().opened.lock().unwrap().len(), opened);
        assert!(Arc::ptr_eq(&state.tables().unwrap().mem, &mem));
        assert_eq!(state.frozen_boundary().unwrap(), 1);
    }

    #[test]
    fn test_rotation_refuses_poisoned_lock() {
        let (state, mut writer) = open_default();
        put(&mut writer, "key", "value");
        writer.begin_rotation().unwrap();
        let frozen = state.frozen_table().unwrap();

        let poisoner = Arc::clone(&state);
        let result = thread::spawn(move || {
            let _guard = poisoner.mem.write().unwrap();
            panic!("panic while holding the state lock");
        })
        .join();
        assert!(result.is_err());
        assert!(state.mem.is_poisoned());

        let opened = state.storage().opened.lock().unwrap().len();
        assert!(matches!(writer.begin_rotation(), Err(Error::Poisoned)));
        assert!(matches!(state.release_frozen(), Err(Error::Poisoned)));

        // The pending generation and its journal survive untouched.
        assert_eq!(state.storage().opened.lock().unwrap().len(), opened);
        assert!(state.storage().deleted.lock().unwrap().is_empty());
        assert_eq!(writer.journal_id(), 2);
        assert!(state.has_frozen());
        let inner = state.mem.read().unwrap_or_else(PoisonError::into_inner);
        let pending = inner.frozen.as_ref().expect("Frozen generation lost");
        assert!(Arc::ptr_eq(&pending.table, &frozen));
        assert_eq!(pending.journal.id, 1);
        assert_eq!(pending.boundary, 1);
    }

    #[test]
    fn test_failed_sync_stops_writer() {
        let (state, mut writer) = open_mock(DbConfig::new("/unused").sync_writes(true));
        writer.journal.fail_sync = true;

        let mut batch = Batch::new();
        batch.put(b"a", b"1");
        assert!(matches!(writer.write(&batch), Err(Error::IoError(_))));

        // The record reached the journal but was never acknowledged, so its
        // sequence numbers must not be handed out again.
        writer.journal.fail_sync = false;
        let mut batch = Batch::new();
        batch.put(b"b", b"2");
        assert!(matches!(writer.write(&batch), Err(Error::JournalFailed(_))));
        assert!(matches!(writer.sync(), Err(Error::JournalFailed(_))));
        assert!(matches!(
            writer.begin_rotation(),
            Err(Error::JournalFailed(_))
        ));

        assert_eq!(state.current_sequence(), 0);
        assert_eq!(state.lookup(b"a").unwrap(), None);
        assert_eq!(state.lookup(b"b").unwrap(), None);
        assert_eq!(writer.journal.records.len(), 1);
        assert_eq!(*state.storage().opened.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_failed_append_stops_writer() {
        let (state, mut writer) = open_default();
        put(&mut writer, "a", "1");
        writer.journal.fail_append = true;

        let mut batch = Batch::new();
        batch.put(b"b", b"2");
        assert!(matches!(writer.write(&batch), Err(Error::IoError(_))));

        writer.journal.fail_append = false;
        assert!(matches!(writer.write(&batch), Err(Error::JournalFailed(_))));
        assert_eq!(state.current_sequence(), 1);
        assert_eq!(state.lookup(b"b").unwrap(), None);
        assert_eq!(state.lookup(b"a").unwrap(), Some(Some(b"1".to_vec())));
        assert_eq!(writer.journal.records.len(), 2);
    }

    #[test]
    fn test_close_failure_during_rotation_rolls_back() {
        let (state, mut writer) = open_default();
        put(&mut writer, "key", "value");
        let before = state.tables().unwrap().mem;
        writer.journal.fail_close = true;

        assert!(matches!(writer.begin_rotation(), Err(Error::IoError(_))));
        assert!(!state.has_frozen());
        assert!(Arc::ptr_eq(&state.tables().unwrap().mem, &before));
        assert_eq!(writer.journal_id(), 1);
        assert_eq!(*state.storage().deleted.lock().unwrap(), vec![2]);
        assert_eq!(*state.storage().released.lock().unwrap(), vec![2]);

        // Buffered records of the old journal may be lost.
        assert!(matches!(
            writer.write(&Batch::new()),
            Err(Error::JournalFailed(_))
        ));
    }

    #[test]
    fn test_abandoned_journal_removed_when_close_fails() {
        let (state, mut writer) = open_default();
        writer.journal.fail_close = true;
        state.storage().fail_journal_close.store(true, Ordering::SeqCst);

        assert!(matches!(writer.begin_rotation(), Err(Error::IoError(_))));
        assert_eq!(*state.storage().deleted.lock().unwrap(), vec![2]);
        assert_eq!(*state.storage().released.lock().unwrap(), vec![2]);
        assert_eq!(state.storage().next_id.load(Ordering::SeqCst), 2);
        assert!(!state.has_frozen());
    }

    #[test]
    fn test_close_is_exactly_once() {
        let (state, writer) = open_default();
        assert!(state.check_open().is_ok());

        assert!(state.mark_closed());
        assert!(!state.mark_closed());
        assert!(state.is_closed());
        assert!(matches!(state.check_open(), Err(Error::Closed)));

        // Closing the writer after the latch still closes its journal.
        writer.close().expect("Writer close failed");
        assert!(state.is_closed());
    }

    #[test]
    fn test_operations_after_close() {
        let (state, mut writer) = open_default();
        put(&mut writer, "key", "value");
        state.mark_closed();

        assert!(matches!(writer.begin_rotation(), Err(Error::Closed)));
        assert!(matches!(writer.write(&Batch::new()), Err(Error::Closed)));
        assert!(matches!(state.tables(), Err(Error::Closed)));
        assert!(matches!(state.frozen_table(), Err(Error::Closed)));
        assert!(matches!(state.lookup(b"key"), Err(Error::Closed)));
        assert!(!state.has_frozen());
        assert_eq!(state.current_sequence(), 1);
    }

    #[test]
    fn test_current_tables_without_lock() {
        let (state, mut writer) = open_default();

        let tables = writer.current_tables();
        assert!(tables.frozen.is_none());
        let old = tables.mem;

        let new = writer.begin_rotation().unwrap();
        let tables = writer.current_tables();
        assert!(Arc::ptr_eq(&tables.mem, &new));
        assert!(Arc::ptr_eq(tables.frozen.as_ref().unwrap(), &old));

        state.release_frozen().unwrap();
        let tables = writer.current_tables();
        assert!(Arc::ptr_eq(&tables.mem, &new));
        assert!(tables.frozen.is_none());
    }

    #[test]
    fn test_write_journals_and_applies() {
        let (state, mut writer) = open_default();

        let mut batch = Batch::new();
        batch.put(&b"a"[..], &b"1"[..]).put(&b"b"[..], &b"2"[..]);
        assert_eq!(writer.write(&batch).unwrap(), 2);

        let mut batch = Batch::new();
        batch.delete(&b"a"[..]);
        assert_eq!(writer.write(&batch).unwrap(), 3);

        // Empty batches consume no sequence numbers.
        assert_eq!(writer.write(&Batch::new()).unwrap(), 3);
        assert_eq!(state.current_sequence(), 3);

        assert_eq!(state.lookup(b"a").unwrap(), Some(None));
        assert_eq!(state.lookup(b"b").unwrap(), Some(Some(b"2".to_vec())));
        assert_eq!(state.lookup(b"c").unwrap(), None);

        let records = &writer.journal.records;
        assert_eq!(records.len(), 2);
        let (first_seq, decoded) = Batch::decode(&records[1]).unwrap();
        assert_eq!(first_seq, 3);
        assert_eq!(
            decoded.iter().collect::<Vec<_>>(),
            vec![(ValueKind::Delete, &b"a"[..], None)]
        );
    }

    #[test]
    fn test_sync_writes() {
        let (_state, mut writer) =
            open_mock(DbConfig::new("/unused").sync_writes(true));
        put(&mut writer, "key", "value");
        put(&mut writer, "key", "value");
        assert_eq!(writer.journal.syncs, 2);
    }

    #[test]
    fn test_lookup_spans_generations() {
        let (state, mut writer) = open_default();
        put(&mut writer, "old", "1");
        put(&mut writer, "shadowed", "old");
        writer.begin_rotation().unwrap();
        put(&mut writer, "shadowed", "new");

        assert_eq!(state.lookup(b"old").unwrap(), Some(Some(b"1".to_vec())));
        assert_eq!(
            state.lookup(b"shadowed").unwrap(),
            Some(Some(b"new".to_vec()))
        );

        state.release_frozen().unwrap();
        assert_eq!(state.lookup(b"old").unwrap(), None);
    }

    #[test]
    fn test_needs_rotation() {
        let (_state, mut writer) = open_mock(
            DbConfig::new("/unused")
                .write_buffer_size(64)
                .write_buffer_percent(50),
        );
        assert!(!writer.needs_rotation());

        put(&mut writer, "key-0000", "value-0000");
        put(&mut writer, "key-0001", "value-0001");
        assert!(writer.needs_rotation());

        writer.begin_rotation().unwrap();
        assert!(!writer.needs_rotation());
    }

    #[test]
    fn test_metrics() {
        let (state, mut writer) = open_default();
        put(&mut writer, "key", "value");
        writer.begin_rotation().unwrap();

        let metrics = state.collect_metrics().unwrap();
        assert_eq!(metrics.mutable_entries, 0);
        assert_eq!(metrics.mutable_capacity, 32 * 1024);
        assert!(metrics.frozen_size.unwrap() > 0);
        assert_eq!(metrics.frozen_boundary, Some(1));
        assert_eq!(metrics.sequence, 1);
        assert_eq!(metrics.rotations, 1);
        assert!(!metrics.closed);
    }

    #[test]
    fn test_readers_never_observe_torn_pair() {
        let (state, mut writer) = open_default();
        let old_mem = state.tables().unwrap().mem;
        let readers = 8;
        let barrier = Arc::new(Barrier::new(readers + 1));
        let done = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..readers)
            .map(|_| {
                let state = Arc::clone(&state);
                let barrier = Arc::clone(&barrier);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    barrier.wait();
                    let mut observed = Vec::new();
                    loop {
                        let finished = done.load(Ordering::Acquire);
                        observed.push(state.tables().unwrap());
                        if finished {
                            break;
                        }
                    }
                    observed
                })
            })
            .collect();

        barrier.wait();
        let new_mem = writer.begin_rotation().unwrap();
        done.store(true, Ordering::Release);

        for handle in handles {
            let observed: Vec<Tables<Memtable>> = handle.join().unwrap();
            for tables in &observed {
                match &tables.frozen {
                    None => assert!(Arc::ptr_eq(&tables.mem, &old_mem)),
                    Some(frozen) => {
                        assert!(Arc::ptr_eq(&tables.mem, &new_mem));
                        assert!(Arc::ptr_eq(frozen, &old_mem));
                    }
                }
            }
            // The last read happened after the rotation completed.
            assert!(observed.last().unwrap().frozen.is_some());
        }
    }

    #[test]
    fn test_file_storage_end_to_end() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let config = DbConfig::new(dir.path()).write_buffer_size(1024);
        let storage = FileStorage::open(&config)?;
        let (state, mut writer) = DbState::open(storage, SkipListFactory, config)?;

        let mut batch = Batch::new();
        batch.put(&b"key1"[..], &b"value1"[..]);
        writer.write(&batch)?;
        let frozen_path = state.storage().journal_path(writer.journal_id());

        writer.begin_rotation()?;
        assert!(frozen_path.exists());
        assert_eq!(state.storage().journal_ids()?, vec![1, 2]);

        // The frozen segment holds the first generation's batch.
        let records = JournalReader::open(&frozen_path)?.collect::<Result<Vec<_>>>()?;
        assert_eq!(records.len(), 1);
        let (first_seq, decoded) = Batch::decode(&records[0])?;
        assert_eq!(first_seq, 1);
        assert_eq!(decoded, batch);

        state.release_frozen()?;
        assert!(!frozen_path.exists());
        assert_eq!(state.storage().journal_ids()?, vec![2]);

        let mut batch = Batch::new();
        batch.put(&b"key2"[..], &b"value2"[..]);
        writer.write(&batch)?;
        let current_path = state.storage().journal_path(writer.journal_id());
        writer.close()?;

        let records = JournalReader::open(&current_path)?.collect::<Result<Vec<_>>>()?;
        assert_eq!(records.len(), 1);
        assert_eq!(Batch::decode(&records[0])?.0, 2);
        assert!(state.is_closed());
        Ok(())
    }
}
