//! # raft-core
//!
//! why: the data model every raft building block agrees on, free of any i/o
//! relations: used by raft-storage for persistence, raft-node for snapshot and timer plumbing
//! what: log ids and entries, peers and configurations, configuration history, errors, options

pub mod configuration;
pub mod configuration_manager;
pub mod error;
pub mod log;
pub mod message;
pub mod options;

pub use configuration::{Configuration, ConfigurationEntry, GroupId, NodeId, PeerId, Role, VersionedGroupId};
pub use configuration_manager::ConfigurationManager;
pub use error::{RaftError, Result};
pub use log::{EntryType, LogEntry, LogId};
pub use message::{InstallSnapshotRequest, InstallSnapshotResponse, SnapshotMeta};
pub use options::{RaftOptions, ThrottleOptions};
