//! # fsm
//!
//! why: snapshots are produced and consumed by the user state machine, the executor only orchestrates
//! relations: called by SnapshotExecutor on blocking workers
//! what: StateMachine

use raft_core::{LogId, Result};
use raft_storage::{SnapshotReader, SnapshotWriter};

/// the replicated application, as far as snapshots are concerned
pub trait StateMachine: Send + Sync + 'static {
    /// id of the last entry applied to the state machine
    fn last_applied(&self) -> LogId;

    /// write the current state into `writer` and return the id it covers.
    /// the executor saves the snapshot meta afterwards.
    fn on_snapshot_save(&self, writer: &mut dyn SnapshotWriter) -> Result<LogId>;

    /// replace the current state with the one in `reader`
    fn on_snapshot_load(&self, reader: &dyn SnapshotReader) -> Result<()>;
}
