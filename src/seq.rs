//! Write sequence counter.
//!
//! Every committed write is tagged with a sequence number taken from this
//! counter. A batch of `n` entries occupies the contiguous range
//! `current + 1 ..= current + n`, so the counter must only ever be advanced
//! by one writer at a time. Reads are lock-free and may happen from any
//! thread.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SequenceCounter {
    seq: AtomicU64,
}

impl SequenceCounter {
    pub fn new(seq: u64) -> Self {
        Self {
            seq: AtomicU64::new(seq),
        }
    }

    /// Last sequence number handed out.
    pub fn current(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Publishes `delta` more sequence numbers. Single writer only.
    pub(crate) fn advance(&self, delta: u64) {
        self.seq.fetch_add(delta, Ordering::AcqRel);
    }
}
