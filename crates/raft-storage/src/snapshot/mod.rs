//! # snapshot
//!
//! why: compaction needs somewhere to put state machine images, and followers need to fetch them
//! relations: driven by the snapshot executor in raft-node, created through the storage registry
//! what: Snapshot / SnapshotWriter / SnapshotReader / SnapshotCopier / SnapshotStorage traits,
//! the local backend and the throughput throttle

mod local;
mod throttle;

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use raft_core::{RaftError, Result, SnapshotMeta};
use serde::{Deserialize, Serialize};

use crate::uri::StorageUri;

pub use local::{
    LocalSnapshotCopier, LocalSnapshotReader, LocalSnapshotStorage, LocalSnapshotStorageFactory, LocalSnapshotWriter,
};
pub use throttle::{SnapshotThrottle, ThroughputSnapshotThrottle};

/// name of the per-snapshot table listing the meta and every file
pub const SNAPSHOT_META_FILE: &str = "__raft_snapshot_meta";

/// what the table remembers about one snapshot file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFileMeta {
    /// crc32 of the whole file, verified by copiers when present
    pub checksum: Option<u32>,
}

impl LocalFileMeta {
    pub fn with_checksum(checksum: u32) -> Self {
        Self { checksum: Some(checksum) }
    }

    /// checksum an existing file
    pub fn of_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self::with_checksum(hasher.finalize()))
    }
}

/// a directory of files plus a meta table
pub trait Snapshot: Send {
    fn path(&self) -> &Path;

    fn list_files(&self) -> Vec<String>;

    fn file_meta(&self, name: &str) -> Option<LocalFileMeta>;
}

/// a snapshot being produced, invisible until its storage commits it
pub trait SnapshotWriter: Snapshot {
    fn save_meta(&mut self, meta: SnapshotMeta) -> Result<()>;

    /// register a file the caller already wrote under `path()`
    fn add_file(&mut self, name: &str, meta: Option<LocalFileMeta>) -> Result<()>;

    fn remove_file(&mut self, name: &str) -> Result<()>;

    /// persist the meta table
    fn sync(&mut self) -> Result<()>;

    /// `last_included.index` of the saved meta, 0 before `save_meta`
    fn snapshot_index(&self) -> u64;
}

/// a committed snapshot; holding one keeps its directory alive
pub trait SnapshotReader: Snapshot {
    fn load_meta(&self) -> Result<SnapshotMeta>;

    /// uri a copier on another storage can fetch this snapshot from
    fn generate_uri_for_copy(&self) -> String;
}

/// an in-flight copy into a snapshot storage
pub trait SnapshotCopier: Send + Sync {
    /// ask the copy to stop; `join` then reports `Interrupted`
    fn cancel(&self);

    /// block until the copy finishes, yielding the committed snapshot
    fn join(&self) -> Result<Box<dyn SnapshotReader>>;
}

pub trait SnapshotStorage: Send + Sync {
    /// create the directory and drop leftovers of interrupted writers
    fn init(&self) -> Result<()>;

    fn create(&self) -> Result<Box<dyn SnapshotWriter>>;

    /// commit: the writer's snapshot becomes the latest one
    fn close_writer(&self, writer: Box<dyn SnapshotWriter>) -> Result<()>;

    /// throw the writer's files away
    fn discard_writer(&self, writer: Box<dyn SnapshotWriter>) -> Result<()>;

    /// the latest committed snapshot, if any
    fn open(&self) -> Option<Box<dyn SnapshotReader>>;

    fn start_to_copy_from(&self, uri: &str) -> Result<Arc<dyn SnapshotCopier>>;

    fn copy_from(&self, uri: &str) -> Result<Box<dyn SnapshotReader>> {
        self.start_to_copy_from(uri)?.join()
    }

    fn set_snapshot_throttle(&self, throttle: Arc<dyn SnapshotThrottle>);
}

/// builds snapshot storages for one uri scheme
pub trait SnapshotStorageFactory: Send + Sync {
    fn new_instance(&self, uri: &StorageUri) -> Result<Arc<dyn SnapshotStorage>>;

    fn gc_instance(&self, uri: &StorageUri) -> Result<()>;
}

pub(crate) fn snapshot_dir_name(index: u64) -> String {
    format!("snapshot_{:020}", index)
}

pub(crate) fn parse_snapshot_dir_name(name: &str) -> Option<u64> {
    name.strip_prefix("snapshot_")?.parse().ok()
}

pub(crate) fn missing_meta(path: &Path) -> RaftError {
    RaftError::Corrupted(format!("snapshot {} has no meta", path.display()))
}
