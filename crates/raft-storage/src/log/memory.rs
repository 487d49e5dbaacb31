//! # memory
//!
//! why: a log that behaves exactly like the durable one, minus the disk
//! relations: selected with `memory://`, used by tests and ephemeral groups
//! what: MemoryLogStorage, MemoryLogStorageFactory

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use raft_core::{ConfigurationManager, LogEntry, RaftError, Result};

use super::{in_range, LogStorage, LogStorageFactory};
use crate::uri::StorageUri;

#[derive(Debug)]
struct MemoryLog {
    first_log_index: u64,
    last_log_index: u64,
    entries: VecDeque<Arc<LogEntry>>,
}

/// in-memory log, nothing survives the process
#[derive(Debug)]
pub struct MemoryLogStorage {
    log: RwLock<MemoryLog>,
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        Self {
            log: RwLock::new(MemoryLog {
                first_log_index: 1,
                last_log_index: 0,
                entries: VecDeque::new(),
            }),
        }
    }
}

impl Default for MemoryLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStorage for MemoryLogStorage {
    fn init(&self, _configuration_manager: &ConfigurationManager) -> Result<()> {
        Ok(())
    }

    fn first_log_index(&self) -> u64 {
        self.log.read().first_log_index
    }

    fn last_log_index(&self) -> u64 {
        self.log.read().last_log_index
    }

    fn get_entry(&self, index: u64) -> Option<Arc<LogEntry>> {
        let log = self.log.read();
        if !in_range(log.first_log_index, log.last_log_index, index) {
            return None;
        }
        log.entries.get((index - log.first_log_index) as usize).cloned()
    }

    fn append_entries(&self, entries: &[Arc<LogEntry>]) -> Result<usize> {
        let mut log = self.log.write();
        for entry in entries {
            assert_eq!(
                entry.index(),
                log.last_log_index + 1,
                "non-contiguous append: last_log_index={}",
                log.last_log_index
            );
            log.entries.push_back(entry.clone());
            log.last_log_index += 1;
        }
        Ok(entries.len())
    }

    fn truncate_prefix(&self, first_index_kept: u64) -> Result<()> {
        let mut log = self.log.write();
        if first_index_kept <= log.first_log_index {
            return Ok(());
        }
        while log.entries.front().map_or(false, |e| e.index() < first_index_kept) {
            log.entries.pop_front();
        }
        log.first_log_index = first_index_kept;
        if first_index_kept > log.last_log_index {
            log.last_log_index = first_index_kept - 1;
        }
        Ok(())
    }

    fn truncate_suffix(&self, last_index_kept: u64) -> Result<()> {
        let mut log = self.log.write();
        assert!(
            last_index_kept + 1 >= log.first_log_index,
            "truncate_suffix({}) below first_log_index {}",
            last_index_kept,
            log.first_log_index
        );
        while log.entries.back().map_or(false, |e| e.index() > last_index_kept) {
            log.entries.pop_back();
        }
        log.last_log_index = log.last_log_index.min(last_index_kept);
        Ok(())
    }

    fn reset(&self, next_log_index: u64) -> Result<()> {
        if next_log_index == 0 {
            return Err(RaftError::InvalidArgument("next_log_index must be positive".into()));
        }
        let mut log = self.log.write();
        log.entries.clear();
        log.first_log_index = next_log_index;
        log.last_log_index = next_log_index - 1;
        Ok(())
    }
}

/// `memory://`
#[derive(Debug, Default)]
pub struct MemoryLogStorageFactory;

impl LogStorageFactory for MemoryLogStorageFactory {
    fn new_instance(&self, _uri: &StorageUri) -> Result<Arc<dyn LogStorage>> {
        Ok(Arc::new(MemoryLogStorage::new()))
    }

    fn gc_instance(&self, _uri: &StorageUri) -> Result<()> {
        Ok(())
    }
}
