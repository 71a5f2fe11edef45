//! Write-path state controller for an LSM key-value engine.
//!
//! ```text
//!   writer ──► MemWriter ──append──► journal N          (current)
//!                 │   └──insert────► mutable memtable
//!                 │
//!                 └─begin_rotation─► journal N   ─► frozen journal
//!                                    memtable    ─► frozen memtable ─► flush
//!                                    fresh journal N+1 + memtable
//!
//!   readers / flush path ──► Arc<DbState>: tables(), frozen_table(),
//!                                          release_frozen(), lookup()
//! ```
//!
//! `DbState` owns the mutable/frozen memtable pair, the frozen journal, the
//! sequence counter and the closed latch. `MemWriter` is the single writer's
//! handle; the storage (`Storage`) and memtable (`TableFactory`)
//! collaborators are traits with file-backed and skip-list implementations.

pub mod batch;
pub mod closed;
pub mod config;
pub mod error;
pub mod flock;
pub mod journal;
pub mod memtable;
pub mod seq;
pub mod state;
pub mod storage;

pub use batch::{Batch, ValueKind};
pub use config::{DbConfig, WRITE_BUFFER_PERCENT};
pub use error::{Error, Result};
pub use journal::{Journal, JournalReader, JournalWriter};
pub use memtable::{Memtable, SkipListFactory, Table, TableFactory};
pub use state::{DbState, MemWriter, StateMetrics, Tables};
pub use storage::{FileStorage, Storage};
