//! # message
//!
//! why: define the snapshot-related payloads exchanged between leader and follower
//! relations: persisted by snapshot storage, consumed by the snapshot executor
//! what: SnapshotMeta, InstallSnapshotRequest, InstallSnapshotResponse

use serde::{Deserialize, Serialize};

use crate::configuration::{Configuration, ConfigurationEntry, GroupId, PeerId};
use crate::log::LogId;

/// Watermark below which the log is obsolete once a snapshot exists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_included: LogId,
    pub configuration: Configuration,
    pub old_configuration: Configuration,
}

impl SnapshotMeta {
    pub fn new(last_included: LogId, conf: &ConfigurationEntry) -> Self {
        Self {
            last_included,
            configuration: conf.conf.clone(),
            old_configuration: conf.old_conf.clone(),
        }
    }

    /// The configuration entry this snapshot establishes as the history floor.
    pub fn configuration_entry(&self) -> ConfigurationEntry {
        ConfigurationEntry::new(
            self.last_included,
            self.configuration.clone(),
            self.old_configuration.clone(),
        )
    }
}

/// Leader asks a lagging follower to install a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub group_id: GroupId,
    pub leader_id: PeerId,
    pub term: u64,
    pub meta: SnapshotMeta,
    /// Where the snapshot content can be copied from
    pub uri: String,
}

/// Response to InstallSnapshotRequest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub success: bool,
}
