//! # log
//!
//! why: the replicated log must survive restarts and be swappable for tests
//! relations: created through the storage registry, compacted by the snapshot executor
//! what: LogStorage trait, LogStorageFactory, memory and segment-file backends

mod memory;
mod segment;
mod segmented;

use std::sync::Arc;

use raft_core::{ConfigurationManager, LogEntry, RaftError, Result};

use crate::uri::StorageUri;

pub use memory::{MemoryLogStorage, MemoryLogStorageFactory};
pub use segment::Segment;
pub use segmented::{SegmentLogStorage, SegmentLogStorageFactory};

/// append-only, randomly truncatable sequence of log entries
///
/// the valid range is `[first_log_index, last_log_index]`, empty iff
/// `first == last + 1`. appends are issued by a single writer; reads may run
/// concurrently and never observe a partially written entry.
pub trait LogStorage: Send + Sync {
    /// open the backing store, check consistency and feed every persisted
    /// configuration entry into `configuration_manager`
    fn init(&self, configuration_manager: &ConfigurationManager) -> Result<()>;

    fn first_log_index(&self) -> u64;

    fn last_log_index(&self) -> u64;

    /// `None` outside `[first_log_index, last_log_index]`
    fn get_entry(&self, index: u64) -> Option<Arc<LogEntry>>;

    /// term of the entry at `index`, 0 when absent
    fn get_term(&self, index: u64) -> u64 {
        self.get_entry(index).map_or(0, |e| e.term())
    }

    /// append entries continuing from `last_log_index() + 1`
    ///
    /// returns how many entries are durable; on a mid-batch failure that count
    /// is smaller than `entries.len()` and the caller resumes from there. an
    /// error is returned only when nothing could be appended.
    ///
    /// # panics
    /// on a non-contiguous batch, which is a caller bug
    fn append_entries(&self, entries: &[Arc<LogEntry>]) -> Result<usize>;

    fn append_entry(&self, entry: Arc<LogEntry>) -> Result<()> {
        let index = entry.index();
        match self.append_entries(&[entry])? {
            1 => Ok(()),
            _ => Err(RaftError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("entry {} was not appended", index),
            ))),
        }
    }

    /// discard `[first_log_index, first_index_kept)`
    fn truncate_prefix(&self, first_index_kept: u64) -> Result<()>;

    /// discard `(last_index_kept, last_log_index]`
    fn truncate_suffix(&self, last_index_kept: u64) -> Result<()>;

    /// drop everything; afterwards `first == last + 1 == next_log_index`
    fn reset(&self, next_log_index: u64) -> Result<()>;

    fn is_empty(&self) -> bool {
        self.first_log_index() > self.last_log_index()
    }
}

/// builds log storages for one uri scheme
pub trait LogStorageFactory: Send + Sync {
    fn new_instance(&self, uri: &StorageUri) -> Result<Arc<dyn LogStorage>>;

    /// remove whatever `uri` persisted
    fn gc_instance(&self, uri: &StorageUri) -> Result<()>;
}

/// shared by backends: the range check every reader performs first
pub(crate) fn in_range(first: u64, last: u64, index: u64) -> bool {
    index >= first && index <= last
}
