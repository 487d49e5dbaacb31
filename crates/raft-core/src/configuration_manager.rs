//! # configuration_manager
//!
//! why: answer "who is in the cluster as of log index N"
//! relations: fed by log storage recovery and appends, compacted by the snapshot executor
//! what: ConfigurationManager, an ordered configuration history with a snapshot floor

use std::collections::VecDeque;

use log::error;
use parking_lot::Mutex;

use crate::configuration::ConfigurationEntry;
use crate::error::{RaftError, Result};

#[derive(Debug, Default)]
struct History {
    configurations: VecDeque<ConfigurationEntry>,
    snapshot: ConfigurationEntry,
}

/// Ordered history of configuration entries, strictly increasing by id.
///
/// Single writer, many readers; every call takes the instance mutex.
#[derive(Debug, Default)]
pub struct ConfigurationManager {
    history: Mutex<History>,
}

impl ConfigurationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `entry`; it must come after the current last entry.
    pub fn add(&self, entry: ConfigurationEntry) -> Result<()> {
        let mut history = self.history.lock();
        if let Some(last) = history.configurations.back() {
            if last.id.index >= entry.id.index {
                error!(
                    "configuration {} is not after {}, truncate_suffix must run before the log goes back",
                    entry.id, last.id
                );
                return Err(RaftError::StaleInsert { entry: entry.id, last: last.id });
            }
        }
        history.configurations.push_back(entry);
        Ok(())
    }

    /// Drops entries below `first_index_kept`.
    ///
    /// The last dropped entry survives when nothing else would describe the
    /// membership at `first_index_kept`.
    pub fn truncate_prefix(&self, first_index_kept: u64) {
        let mut history = self.history.lock();
        let mut governing = None;
        while history
            .configurations
            .front()
            .map_or(false, |e| e.id.index < first_index_kept)
        {
            governing = history.configurations.pop_front();
        }
        if let Some(entry) = governing {
            let covered = history
                .configurations
                .front()
                .map_or(false, |e| e.id.index == first_index_kept);
            if !covered && entry.id.index > history.snapshot.id.index {
                history.configurations.push_front(entry);
            }
        }
    }

    /// Drops entries beyond `last_index_kept`.
    pub fn truncate_suffix(&self, last_index_kept: u64) {
        let mut history = self.history.lock();
        while history
            .configurations
            .back()
            .map_or(false, |e| e.id.index > last_index_kept)
        {
            history.configurations.pop_back();
        }
    }

    /// Installs `entry` as the compaction floor and forgets history at or below it.
    ///
    /// # Panics
    /// If the watermark would move backwards.
    pub fn set_snapshot(&self, entry: ConfigurationEntry) {
        let mut history = self.history.lock();
        assert!(
            entry.id >= history.snapshot.id,
            "snapshot watermark moved backwards: {} < {}",
            entry.id,
            history.snapshot.id
        );
        while history
            .configurations
            .front()
            .map_or(false, |e| e.id.index <= entry.id.index)
        {
            history.configurations.pop_front();
        }
        history.snapshot = entry;
    }

    /// Membership governing `index`: the greatest entry with `id.index <= index`,
    /// or the snapshot floor.
    pub fn get(&self, index: u64) -> ConfigurationEntry {
        let history = self.history.lock();
        history
            .configurations
            .iter()
            .rev()
            .find(|e| e.id.index <= index)
            .unwrap_or(&history.snapshot)
            .clone()
    }

    pub fn last_configuration(&self) -> ConfigurationEntry {
        let history = self.history.lock();
        history
            .configurations
            .back()
            .unwrap_or(&history.snapshot)
            .clone()
    }

    pub fn snapshot(&self) -> ConfigurationEntry {
        self.history.lock().snapshot.clone()
    }

    /// Number of entries above the snapshot floor.
    pub fn len(&self) -> usize {
        self.history.lock().configurations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.lock().configurations.is_empty()
    }
}
