//! # options
//!
//! why: one place for the knobs that pick backends and drive timers
//! relations: read by raft-node when opening storages and arming timers
//! what: RaftOptions and ThrottleOptions, loadable from toml

use std::path::Path;

use serde::Deserialize;

use crate::error::{RaftError, Result};

/// Snapshot copy throttling
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ThrottleOptions {
    pub throughput_bytes_per_s: u64,
    /// Number of throughput checks per second
    pub check_cycle: u32,
    /// Concurrent snapshot copies allowed, 0 means unlimited
    pub max_tasks: u32,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            throughput_bytes_per_s: 30 * 1024 * 1024,
            check_cycle: 10,
            max_tasks: 0,
        }
    }
}

/// Per-node raft settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RaftOptions {
    pub election_timeout_ms: u64,
    /// Upper bound of the random delay added to each election timeout
    pub max_election_delay_ms: u64,
    /// 0 disables periodic snapshots
    pub snapshot_interval_s: u64,
    pub log_uri: String,
    pub raft_meta_uri: String,
    pub snapshot_uri: String,
    /// fsync log appends before reporting them
    pub raft_sync: bool,
    pub raft_sync_meta: bool,
    pub max_segment_size: u64,
    pub snapshot_throttle: Option<ThrottleOptions>,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            election_timeout_ms: 1000,
            max_election_delay_ms: 1000,
            snapshot_interval_s: 3600,
            log_uri: "memory://".to_string(),
            raft_meta_uri: "memory://".to_string(),
            snapshot_uri: String::new(),
            raft_sync: true,
            raft_sync_meta: true,
            max_segment_size: 8 * 1024 * 1024,
            snapshot_throttle: None,
        }
    }
}

impl RaftOptions {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| RaftError::InvalidArgument(format!("bad raft options: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Options with every backend rooted under `dir`
    pub fn local(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().display();
        Self {
            log_uri: format!("local://{}/log", dir),
            raft_meta_uri: format!("local://{}/raft_meta", dir),
            snapshot_uri: format!("local://{}/snapshot", dir),
            ..Self::default()
        }
    }
}
