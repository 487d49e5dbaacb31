//! # snapshot_executor
//!
//! why: snapshots are the only way to bound the log and to catch up a follower that fell
//! behind the leader's compaction point
//! relations: drives StateMachine save/load, SnapshotStorage, LogStorage and ConfigurationManager
//! compaction; SnapshotTimer triggers it periodically
//! what: SnapshotExecutor, SnapshotTimer
//!
//! one executor per node, one mutex per executor:
//!
//! ```text
//!          do_snapshot                    install_snapshot
//!   Idle ──────────────> Saving     Idle ──────────────> Downloading ──> Loading
//!    ^                     │         ^                       │              │
//!    └─────────────────────┘         └── interrupted/failed ─┴──────────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use raft_core::{
    ConfigurationManager, InstallSnapshotRequest, InstallSnapshotResponse, LogId, RaftError, RaftOptions, Result,
    SnapshotMeta,
};
use raft_storage::{LogStorage, SnapshotCopier, SnapshotReader, SnapshotStorage, SnapshotWriter};
use tokio::runtime::Handle;
use tokio::task::JoinError;

use crate::fsm::StateMachine;
use crate::storages::RaftStorages;
use crate::timer::{RepeatedTimerTask, TimerTask};

/// the single in-flight download
struct DownloadingSnapshot {
    id: u64,
    last_included: LogId,
    copier: Arc<dyn SnapshotCopier>,
}

#[derive(Default)]
struct ExecutorState {
    term: u64,
    last_snapshot: LogId,
    saving: bool,
    loading: bool,
    stopped: bool,
    downloading: Option<DownloadingSnapshot>,
}

/// everything a blocking save or install job needs after its caller has gone away
struct ExecutorCore {
    fsm: Arc<dyn StateMachine>,
    snapshot_storage: Arc<dyn SnapshotStorage>,
    log_storage: Arc<dyn LogStorage>,
    configuration_manager: Arc<ConfigurationManager>,
    state: Mutex<ExecutorState>,
    /// id of the download being installed, 0 when idle; stays set while loading
    downloading_id: AtomicU64,
    next_download_id: AtomicU64,
}

/// takes and installs snapshots for one node
///
/// save and install jobs run to completion on a blocking worker even when the
/// future awaiting them is dropped; the saving, loading and download flags are
/// released by the job, not by the caller.
pub struct SnapshotExecutor {
    core: Arc<ExecutorCore>,
}

impl fmt::Debug for SnapshotExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("SnapshotExecutor")
            .field("term", &state.term)
            .field("last_snapshot", &state.last_snapshot)
            .field("saving", &state.saving)
            .field("loading", &state.loading)
            .field("downloading", &state.downloading.as_ref().map(|d| d.last_included))
            .field("stopped", &state.stopped)
            .finish()
    }
}

fn join_error(e: JoinError) -> RaftError {
    RaftError::Interrupted(format!("snapshot task did not finish: {}", e))
}

/// drop the log below the snapshot and move the configuration floor up to it
fn compact(log_storage: &dyn LogStorage, configuration_manager: &ConfigurationManager, meta: &SnapshotMeta) -> Result<()> {
    let id = meta.last_included;
    let term = log_storage.get_term(id.index);
    if term == 0 || term == id.term {
        // already compacted, behind the snapshot, or agreeing with it
        log_storage.truncate_prefix(id.index + 1)?;
    } else {
        // the local log diverges from the snapshot, none of it can be trusted
        log_storage.reset(id.index + 1)?;
        configuration_manager.truncate_suffix(id.index);
    }
    configuration_manager.set_snapshot(meta.configuration_entry());
    Ok(())
}

/// owned by the save job; resets `saving` when the job ends, panics included
struct SavingGuard(Arc<ExecutorCore>);

impl Drop for SavingGuard {
    fn drop(&mut self) {
        self.0.state.lock().saving = false;
    }
}

/// owned by the install job; releases the download slot or the loading flag
struct InstallGuard {
    core: Arc<ExecutorCore>,
    id: u64,
    loading: bool,
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        let mut state = self.core.state.lock();
        if self.loading {
            state.loading = false;
            self.core.downloading_id.store(0, Ordering::Release);
        } else if state.downloading.as_ref().map_or(false, |d| d.id == self.id) {
            if let Some(download) = state.downloading.take() {
                download.copier.cancel();
            }
            self.core.downloading_id.store(0, Ordering::Release);
        }
    }
}

impl ExecutorCore {
    /// blocking half of `do_snapshot`
    fn save(&self, _saving: SavingGuard, last_snapshot: LogId) -> Result<LogId> {
        let mut writer = self.snapshot_storage.create()?;
        let id = match self.fsm.on_snapshot_save(writer.as_mut()) {
            Ok(id) if id.index > last_snapshot.index => id,
            Ok(id) => {
                info!("discarding stale snapshot {}, last is {}", id, last_snapshot);
                self.snapshot_storage.discard_writer(writer)?;
                return Ok(last_snapshot);
            }
            Err(e) => {
                if let Err(discard) = self.snapshot_storage.discard_writer(writer) {
                    warn!("failed to discard snapshot writer: {}", discard);
                }
                return Err(e);
            }
        };
        let meta = SnapshotMeta::new(id, &self.configuration_manager.get(id.index));
        writer.save_meta(meta.clone())?;
        self.snapshot_storage.close_writer(writer)?;
        compact(self.log_storage.as_ref(), &self.configuration_manager, &meta)?;

        self.state.lock().last_snapshot = id;
        info!("saved snapshot {}", id);
        Ok(id)
    }

    /// blocking half of `install_snapshot`: wait for the copy, then load it
    fn install(
        &self,
        mut guard: InstallGuard,
        copier: Arc<dyn SnapshotCopier>,
        last_included: LogId,
    ) -> Result<InstallSnapshotResponse> {
        let joined = copier.join();
        {
            let mut state = self.state.lock();
            if state.downloading.as_ref().map(|d| d.id) != Some(guard.id) {
                return Err(RaftError::Interrupted(format!("download of snapshot {} was interrupted", last_included)));
            }
            if joined.is_ok() {
                state.downloading = None;
                state.loading = true;
                guard.loading = true;
            }
        }
        let reader = joined?;

        let meta = reader.load_meta()?;
        self.fsm.on_snapshot_load(reader.as_ref())?;
        compact(self.log_storage.as_ref(), &self.configuration_manager, &meta)?;

        let response = {
            let mut state = self.state.lock();
            state.last_snapshot = meta.last_included;
            InstallSnapshotResponse { term: state.term, success: true }
        };
        info!("installed snapshot {}", meta.last_included);
        Ok(response)
    }

    fn cancel_download_locked(&self, state: &mut ExecutorState, reason: &str) {
        if state.loading {
            return;
        }
        if let Some(download) = state.downloading.take() {
            info!("interrupting download of snapshot {}: {}", download.last_included, reason);
            download.copier.cancel();
            self.downloading_id.store(0, Ordering::Release);
        }
    }
}

impl SnapshotExecutor {
    pub fn new(
        fsm: Arc<dyn StateMachine>,
        snapshot_storage: Arc<dyn SnapshotStorage>,
        log_storage: Arc<dyn LogStorage>,
        configuration_manager: Arc<ConfigurationManager>,
    ) -> Self {
        Self {
            core: Arc::new(ExecutorCore {
                fsm,
                snapshot_storage,
                log_storage,
                configuration_manager,
                state: Mutex::new(ExecutorState::default()),
                downloading_id: AtomicU64::new(0),
                next_download_id: AtomicU64::new(0),
            }),
        }
    }

    /// an executor over opened storages; fails when no snapshot uri was configured
    pub fn from_storages(fsm: Arc<dyn StateMachine>, storages: &RaftStorages) -> Result<Self> {
        let snapshot_storage = storages
            .snapshot
            .clone()
            .ok_or_else(|| RaftError::InvalidArgument("snapshot_uri is not configured".into()))?;
        Ok(Self::new(
            fsm,
            snapshot_storage,
            storages.log.clone(),
            storages.configuration_manager.clone(),
        ))
    }

    /// load the newest local snapshot into the state machine and compact the log to it.
    /// the snapshot storage must already be initialized.
    pub fn init(&self) -> Result<()> {
        let core = &self.core;
        let reader = match core.snapshot_storage.open() {
            Some(reader) => reader,
            None => {
                info!("no local snapshot to load");
                return Ok(());
            }
        };
        let meta = reader.load_meta()?;
        core.fsm.on_snapshot_load(reader.as_ref())?;
        compact(core.log_storage.as_ref(), &core.configuration_manager, &meta)?;
        core.state.lock().last_snapshot = meta.last_included;
        info!("loaded snapshot {} on startup", meta.last_included);
        Ok(())
    }

    pub fn last_snapshot(&self) -> LogId {
        self.core.state.lock().last_snapshot
    }

    pub fn term(&self) -> u64 {
        self.core.state.lock().term
    }

    /// true from the moment a download is registered until its load finishes
    pub fn is_installing_snapshot(&self) -> bool {
        self.core.downloading_id.load(Ordering::Acquire) != 0
    }

    /// save the state machine into a new snapshot and compact the log up to it
    ///
    /// returns the id the newest snapshot covers; when nothing was applied since
    /// the last snapshot that id is returned unchanged.
    pub async fn do_snapshot(&self) -> Result<LogId> {
        let last_snapshot = {
            let mut state = self.core.state.lock();
            if state.stopped {
                return Err(RaftError::Stopped);
            }
            if state.saving {
                return Err(RaftError::Busy("a snapshot is being saved".into()));
            }
            if state.downloading.is_some() || state.loading {
                return Err(RaftError::Busy("a snapshot is being installed".into()));
            }
            let applied = self.core.fsm.last_applied();
            if applied.index <= state.last_snapshot.index {
                debug!("nothing applied since snapshot {}, skipping", state.last_snapshot);
                return Ok(state.last_snapshot);
            }
            state.saving = true;
            state.last_snapshot
        };
        let saving = SavingGuard(self.core.clone());

        let core = self.core.clone();
        tokio::task::spawn_blocking(move || core.save(saving, last_snapshot))
            .await
            .map_err(join_error)
            .and_then(|r| r)
            .map_err(|e| {
                warn!("snapshot save failed: {}", e);
                e
            })
    }

    /// download the leader's snapshot, load it into the state machine and reset the log to it
    pub async fn install_snapshot(&self, request: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        let last_included = request.meta.last_included;
        let (id, copier) = {
            let mut state = self.core.state.lock();
            if state.stopped {
                return Err(RaftError::Stopped);
            }
            if request.term < state.term {
                warn!(
                    "rejecting snapshot {} from {}: term {} is behind {}",
                    last_included, request.leader_id, request.term, state.term
                );
                return Err(RaftError::TermMismatch { request_term: request.term, current_term: state.term });
            }
            if request.term > state.term {
                state.term = request.term;
                self.core.cancel_download_locked(&mut state, "a newer term");
            }
            if last_included.index <= state.last_snapshot.index {
                info!("snapshot {} is not newer than {}, nothing to install", last_included, state.last_snapshot);
                return Ok(InstallSnapshotResponse { term: state.term, success: true });
            }
            if state.saving {
                return Err(RaftError::Busy("a snapshot is being saved".into()));
            }
            if state.loading {
                return Err(RaftError::Busy("a snapshot is being loaded".into()));
            }
            if let Some(current) = &state.downloading {
                if last_included.index < current.last_included.index {
                    return Err(RaftError::Busy(format!(
                        "snapshot {} is downloading, {} is older",
                        current.last_included, last_included
                    )));
                }
            }
            self.core.cancel_download_locked(&mut state, "a retried request");

            let copier = self.core.snapshot_storage.start_to_copy_from(&request.uri)?;
            let id = self.core.next_download_id.fetch_add(1, Ordering::Relaxed) + 1;
            state.downloading = Some(DownloadingSnapshot { id, last_included, copier: copier.clone() });
            self.core.downloading_id.store(id, Ordering::Release);
            info!("downloading snapshot {} from {} ({})", last_included, request.leader_id, request.uri);
            (id, copier)
        };
        let guard = InstallGuard { core: self.core.clone(), id, loading: false };

        let core = self.core.clone();
        tokio::task::spawn_blocking(move || core.install(guard, copier, last_included))
            .await
            .map_err(join_error)
            .and_then(|r| r)
    }

    /// abort a download in progress; the pending install fails with `Interrupted`.
    /// a snapshot that is already loading is left alone.
    pub fn interrupt_downloading_snapshot(&self, new_term: u64) {
        let mut state = self.core.state.lock();
        state.term = state.term.max(new_term);
        self.core.cancel_download_locked(&mut state, "term change");
    }

    /// interrupt any download and reject later calls with `Stopped`
    pub fn shutdown(&self) {
        let mut state = self.core.state.lock();
        state.stopped = true;
        self.core.cancel_download_locked(&mut state, "shutdown");
    }
}

/// periodic `do_snapshot`, first firing randomized so a cluster does not snapshot in lockstep
pub struct SnapshotTimer {
    executor: Arc<SnapshotExecutor>,
    runtime: Handle,
    first_schedule: AtomicBool,
}

impl SnapshotTimer {
    pub fn new(executor: Arc<SnapshotExecutor>, runtime: Handle) -> Self {
        Self { executor, runtime, first_schedule: AtomicBool::new(true) }
    }

    /// a started timer firing every `snapshot_interval_s`, or `None` when that is 0
    pub fn start(executor: Arc<SnapshotExecutor>, options: &RaftOptions) -> Result<Option<RepeatedTimerTask<Self>>> {
        if options.snapshot_interval_s == 0 {
            return Ok(None);
        }
        let runtime = Handle::try_current()
            .map_err(|e| RaftError::InvalidArgument(format!("snapshot timer needs a tokio runtime: {}", e)))?;
        let timer = RepeatedTimerTask::with_runtime(
            Self::new(executor, runtime.clone()),
            options.snapshot_interval_s * 1000,
            runtime,
        );
        timer.start();
        Ok(Some(timer))
    }
}

impl TimerTask for SnapshotTimer {
    fn run(&self) {
        let executor = self.executor.clone();
        self.runtime.spawn(async move {
            match executor.do_snapshot().await {
                Ok(id) => debug!("snapshot timer done at {}", id),
                Err(e) if e.is_protocol_outcome() => debug!("snapshot timer skipped: {}", e),
                Err(e) => warn!("snapshot timer failed: {}", e),
            }
        });
    }

    fn adjust_timeout(&self, timeout: Duration) -> Duration {
        let ms = timeout.as_millis() as u64;
        if ms > 0 && self.first_schedule.swap(false, Ordering::AcqRel) {
            return Duration::from_millis(rand::thread_rng().gen_range(1..=ms));
        }
        timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft_core::{ConfigurationEntry, LogEntry};
    use raft_storage::{LocalSnapshotStorage, MemoryLogStorage, Snapshot};
    use std::fs;
    use tempfile::tempdir;

    struct Counter {
        applied: Mutex<LogId>,
        loaded: Mutex<Option<Vec<u8>>>,
    }

    impl Counter {
        fn at(index: u64) -> Arc<Self> {
            Arc::new(Self { applied: Mutex::new(LogId::new(1, index)), loaded: Mutex::new(None) })
        }
    }

    impl StateMachine for Counter {
        fn last_applied(&self) -> LogId {
            *self.applied.lock()
        }

        fn on_snapshot_save(&self, writer: &mut dyn SnapshotWriter) -> Result<LogId> {
            let applied = *self.applied.lock();
            fs::write(writer.path().join("state"), applied.index.to_be_bytes())?;
            writer.add_file("state", None)?;
            Ok(applied)
        }

        fn on_snapshot_load(&self, reader: &dyn SnapshotReader) -> Result<()> {
            *self.loaded.lock() = Some(fs::read(reader.path().join("state"))?);
            Ok(())
        }
    }

    fn executor(dir: &std::path::Path, fsm: Arc<Counter>, log: Arc<MemoryLogStorage>) -> SnapshotExecutor {
        let storage = LocalSnapshotStorage::new(dir, false);
        storage.init().unwrap();
        SnapshotExecutor::new(fsm, Arc::new(storage), log, Arc::new(ConfigurationManager::new()))
    }

    fn filled_log(last: u64) -> Arc<MemoryLogStorage> {
        let log = Arc::new(MemoryLogStorage::new());
        log.init(&ConfigurationManager::new()).unwrap();
        for i in 1..=last {
            log.append_entry(Arc::new(LogEntry::new(1, i, vec![i as u8]))).unwrap();
        }
        log
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn do_snapshot_compacts_log() {
        let dir = tempdir().unwrap();
        let log = filled_log(10);
        let exec = executor(dir.path(), Counter::at(7), log.clone());

        assert_eq!(exec.do_snapshot().await.unwrap(), LogId::new(1, 7));
        assert_eq!(exec.last_snapshot(), LogId::new(1, 7));
        assert_eq!(log.first_log_index(), 8);
        assert_eq!(log.last_log_index(), 10);

        // nothing new applied
        assert_eq!(exec.do_snapshot().await.unwrap(), LogId::new(1, 7));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_install_succeeds_without_copy() {
        let dir = tempdir().unwrap();
        let exec = executor(dir.path(), Counter::at(5), filled_log(5));
        exec.do_snapshot().await.unwrap();

        let request = InstallSnapshotRequest {
            group_id: "g".into(),
            leader_id: "127.0.0.1:8000".parse().unwrap(),
            term: 1,
            meta: SnapshotMeta::new(LogId::new(1, 3), &ConfigurationEntry::default()),
            uri: "local:///does/not/exist".into(),
        };
        let response = exec.install_snapshot(request).await.unwrap();
        assert!(response.success);
        assert!(!exec.is_installing_snapshot());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stopped_executor_rejects_work() {
        let dir = tempdir().unwrap();
        let exec = executor(dir.path(), Counter::at(5), filled_log(5));
        exec.shutdown();
        assert!(matches!(exec.do_snapshot().await, Err(RaftError::Stopped)));
    }

    #[test]
    fn interrupt_raises_term_only() {
        let dir = tempdir().unwrap();
        let exec = executor(dir.path(), Counter::at(0), filled_log(0));
        exec.interrupt_downloading_snapshot(4);
        exec.interrupt_downloading_snapshot(2);
        assert_eq!(exec.term(), 4);
        assert!(!exec.is_installing_snapshot());
    }

    #[test]
    fn first_timer_firing_is_randomized() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempdir().unwrap();
        let exec = Arc::new(executor(dir.path(), Counter::at(0), filled_log(0)));
        let timer = SnapshotTimer::new(exec, rt.handle().clone());
        let first = timer.adjust_timeout(Duration::from_millis(1000));
        assert!(first >= Duration::from_millis(1) && first <= Duration::from_millis(1000));
        assert_eq!(timer.adjust_timeout(Duration::from_millis(1000)), Duration::from_millis(1000));
    }
}
