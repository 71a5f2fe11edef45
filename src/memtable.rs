//! Memtable implementation using a concurrent skip list.
//!
//! The rotation protocol never looks inside a memtable; it only needs to
//! build fresh ones (`TableFactory`) and hand them to the writer and readers
//! (`Table`). The bundled `Memtable` is a `crossbeam-skiplist` `SkipMap`
//! keyed by user key ascending, then sequence number descending, so a lookup
//! at snapshot `s` finds the newest version with sequence `<= s` by seeking
//! to `(key, s)`.
//!
//! Deletions are stored as tombstones so they shadow older versions in
//! frozen memtables and on-disk tables.

use crossbeam_skiplist::SkipMap;
use std::cmp::Reverse;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::batch::ValueKind;

/// Fixed per-entry overhead charged against the capacity budget.
const ENTRY_OVERHEAD: usize = 8;

/// In-memory sorted table as seen by the write-path state.
pub trait Table: Send + Sync {
    /// Inserts one version of `key` tagged with `seq`.
    fn insert(&self, seq: u64, kind: ValueKind, key: &[u8], value: &[u8]);

    /// Newest version of `key` visible at `seq`: `Some(None)` for a
    /// tombstone, `None` if the table has no version at all.
    fn get(&self, key: &[u8], seq: u64) -> Option<Option<Vec<u8>>>;

    /// Bytes charged against the capacity budget so far.
    fn approximate_size(&self) -> usize;

    /// Budget this table was created with.
    fn capacity(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_full(&self) -> bool {
        self.approximate_size() >= self.capacity()
    }
}

/// Builds the mutable memtable installed by each rotation.
pub trait TableFactory: Send + Sync {
    type Table: Table;

    fn new_table(&self, capacity: usize) -> Self::Table;
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct InternalKey {
    user_key: Vec<u8>,
    seq: Reverse<u64>,
}

impl InternalKey {
    fn new(user_key: Vec<u8>, seq: u64) -> Self {
        Self {
            user_key,
            seq: Reverse(seq),
        }
    }
}

/// Skip-list memtable with bytewise key ordering.
#[derive(Debug)]
pub struct Memtable {
    data: SkipMap<InternalKey, Option<Vec<u8>>>,
    size: AtomicUsize,
    capacity: usize,
}

impl Memtable {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: SkipMap::new(),
            size: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Iterates over every version in internal-key order.
    pub fn iter(&self) -> impl Iterator<Item = (Vec<u8>, u64, Option<Vec<u8>>)> + '_ {
        self.data.iter().map(|entry| {
            let key = entry.key();
            (key.user_key.clone(), key.seq.0, entry.value().clone())
        })
    }
}

impl Table for Memtable {
    fn insert(&self, seq: u64, kind: ValueKind, key: &[u8], value: &[u8]) {
        let value = match kind {
            ValueKind::Put => Some(value.to_vec()),
            ValueKind::Delete => None,
        };
        let entry_size = key.len() + value.as_ref().map_or(0, |v| v.len()) + ENTRY_OVERHEAD;

        self.data.insert(InternalKey::new(key.to_vec(), seq), value);
        self.size.fetch_add(entry_size, Ordering::SeqCst);
    }

    fn get(&self, key: &[u8], seq: u64) -> Option<Option<Vec<u8>>> {
        let start = InternalKey::new(key.to_vec(), seq);
        let entry = self
            .data
            .range((Bound::Included(start), Bound::Unbounded))
            .next()?;
        if entry.key().user_key.as_slice() != key {
            return None;
        }
        Some(entry.value().clone())
    }

    fn approximate_size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// Factory for `Memtable`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipListFactory;

impl TableFactory for SkipListFactory {
    type Table = Memtable;

    fn new_table(&self, capacity: usize) -> Memtable {
        Memtable::new(capacity)
    }
}
