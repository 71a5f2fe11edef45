use std::path::PathBuf;

/// Share of the write buffer handed to each new mutable memtable.
pub const WRITE_BUFFER_PERCENT: u32 = 50;

/// Configuration for the write-path state
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Directory holding journal segments and the lock file
    pub dir: PathBuf,

    /// Write buffer budget in bytes (default: 4MB)
    pub write_buffer_size: usize,

    /// Percentage of `write_buffer_size` given to each mutable memtable
    /// (default: `WRITE_BUFFER_PERCENT`)
    pub write_buffer_percent: u32,

    /// Journal writer buffer size (default: 64KB)
    pub journal_buffer_size: usize,

    /// Sync the journal after every batch (default: false)
    pub sync_writes: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            write_buffer_size: 4 * 1024 * 1024, // 4MB
            write_buffer_percent: WRITE_BUFFER_PERCENT,
            journal_buffer_size: 64 * 1024, // 64KB
            sync_writes: false,
        }
    }
}

impl DbConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the write buffer budget
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set the memtable share of the write buffer
    pub fn write_buffer_percent(mut self, percent: u32) -> Self {
        self.write_buffer_percent = percent;
        self
    }

    /// Set journal buffer size
    pub fn journal_buffer_size(mut self, size: usize) -> Self {
        self.journal_buffer_size = size;
        self
    }

    /// Sync the journal after every write
    pub fn sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }

    /// Capacity given to each freshly rotated-in memtable.
    pub fn table_capacity(&self) -> usize {
        to_percent(self.write_buffer_size, self.write_buffer_percent)
    }
}

fn to_percent(n: usize, percent: u32) -> usize {
    (n as u128 * percent as u128 / 100) as usize
}
