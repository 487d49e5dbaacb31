//! # raft-storage
//!
//! why: persist raft state on disk so a node restarts where it stopped
//! relations: builds on raft-core types, consumed by raft-node through the storage registry
//! what: LogStorage, RaftMetaStorage and SnapshotStorage traits with their
//! local and in-memory backends, the record file format, uri parsing
//!
//! every backend is selected by a `scheme://path?params` uri:
//!
//! | kind     | schemes                          |
//! |----------|----------------------------------|
//! | log      | `local`, `memory`                |
//! | meta     | `local`, `local-merged`, `memory`|
//! | snapshot | `local`                          |

pub mod log;
pub mod meta;
pub mod record;
pub mod registry;
pub mod snapshot;
pub mod uri;

pub use self::log::{
    LogStorage, LogStorageFactory, MemoryLogStorage, MemoryLogStorageFactory, Segment, SegmentLogStorage,
    SegmentLogStorageFactory,
};
pub use self::meta::{
    FileMetaStorage, MemoryMetaStorage, MergedMetaStorage, RaftMetaStorage, RaftMetaStorageFactory, StableMeta,
    INITIAL_TERM,
};
pub use self::record::RecordFile;
pub use self::registry::StorageRegistry;
pub use self::snapshot::{
    LocalFileMeta, LocalSnapshotCopier, LocalSnapshotReader, LocalSnapshotStorage, LocalSnapshotWriter, Snapshot,
    SnapshotCopier, SnapshotReader, SnapshotStorage, SnapshotStorageFactory, SnapshotThrottle, SnapshotWriter,
    ThroughputSnapshotThrottle,
};
pub use self::uri::{gc_dir, parse_uri, StorageUri};
