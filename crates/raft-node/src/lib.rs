//! # raft-node
//!
//! why: the moving parts around a raft node that run on their own schedule
//! relations: built on raft-core types and raft-storage backends, driven by tokio
//! what: repeated timers, the snapshot executor, the node registry, storage bundles
//!
//! blocking work (state machine save/load, snapshot copies) runs on
//! `spawn_blocking` workers or the copier's own thread, never on the tasks
//! that drive timers.

pub mod fsm;
pub mod registry;
pub mod snapshot_executor;
pub mod storages;
pub mod timer;

pub use fsm::StateMachine;
pub use registry::{NodeRegistry, RegisteredNode};
pub use snapshot_executor::{SnapshotExecutor, SnapshotTimer};
pub use storages::RaftStorages;
pub use timer::{random_timeout, RepeatedTimerTask, TimerTask};
