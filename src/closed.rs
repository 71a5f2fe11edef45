use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

/// One-way open -> closed latch.
#[derive(Debug, Default)]
pub struct ClosedFlag {
    closed: AtomicBool,
}

impl ClosedFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only for the call that actually closed.
    pub fn mark_closed(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Guard for every externally visible operation.
    pub fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }
}
