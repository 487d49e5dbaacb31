//! # storages
//!
//! why: a node needs its log, meta and snapshot storages opened in the right order from one options struct
//! relations: resolves uris through raft-storage's StorageRegistry, feeds SnapshotExecutor
//! what: RaftStorages

use std::fmt;
use std::sync::Arc;

use log::info;
use raft_core::{ConfigurationManager, PeerId, RaftOptions, Result};
use raft_storage::{
    LogStorage, RaftMetaStorage, SnapshotStorage, StorageRegistry, StorageUri, ThroughputSnapshotThrottle,
};

/// append `key=value` unless the uri already sets `key`
fn with_default_param(uri: &str, key: &str, value: impl fmt::Display) -> Result<String> {
    if StorageUri::parse(uri)?.param(key).is_some() {
        return Ok(uri.to_string());
    }
    let separator = if uri.contains('?') { '&' } else { '?' };
    Ok(format!("{}{}{}={}", uri.trim(), separator, key, value))
}

/// the initialized storages of one raft node
pub struct RaftStorages {
    pub group: String,
    pub log: Arc<dyn LogStorage>,
    pub meta: Arc<dyn RaftMetaStorage>,
    /// `None` when no snapshot uri is configured
    pub snapshot: Option<Arc<dyn SnapshotStorage>>,
    /// rebuilt from the log's configuration entries during open
    pub configuration_manager: Arc<ConfigurationManager>,
}

impl fmt::Debug for RaftStorages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftStorages")
            .field("group", &self.group)
            .field("first_log_index", &self.log.first_log_index())
            .field("last_log_index", &self.log.last_log_index())
            .field("snapshot", &self.snapshot.is_some())
            .finish()
    }
}

impl RaftStorages {
    /// create and initialize every storage named in `options`
    ///
    /// `raft_sync`, `raft_sync_meta` and `max_segment_size` become uri params
    /// unless the uri sets them itself.
    pub fn open(options: &RaftOptions, registry: &StorageRegistry, group: &str) -> Result<Self> {
        let configuration_manager = Arc::new(ConfigurationManager::new());

        let log_uri = with_default_param(&options.log_uri, "sync", options.raft_sync)?;
        let log_uri = with_default_param(&log_uri, "max_segment_size", options.max_segment_size)?;
        let log = registry.create_log_storage(&log_uri)?;
        log.init(&configuration_manager)?;

        let meta_uri = with_default_param(&options.raft_meta_uri, "sync", options.raft_sync_meta)?;
        let meta = registry.create_meta_storage(&meta_uri)?;
        meta.init()?;

        let snapshot = if options.snapshot_uri.trim().is_empty() {
            None
        } else {
            let snapshot_uri = with_default_param(&options.snapshot_uri, "sync", options.raft_sync_meta)?;
            let storage = registry.create_snapshot_storage(&snapshot_uri)?;
            if let Some(throttle) = &options.snapshot_throttle {
                storage.set_snapshot_throttle(Arc::new(ThroughputSnapshotThrottle::from_options(throttle)));
            }
            storage.init()?;
            Some(storage)
        };

        info!(
            "opened storages of group {}: log [{}, {}], {} configuration entries",
            group,
            log.first_log_index(),
            log.last_log_index(),
            configuration_manager.len()
        );
        Ok(Self { group: group.to_string(), log, meta, snapshot, configuration_manager })
    }

    pub fn term_and_voted_for(&self) -> Result<(u64, PeerId)> {
        self.meta.get_term_and_votedfor(&self.group)
    }

    pub fn set_term_and_voted_for(&self, term: u64, voted_for: &PeerId) -> Result<()> {
        self.meta.set_term_and_votedfor(term, voted_for, &self.group)
    }
}
