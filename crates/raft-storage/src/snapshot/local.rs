//! # local
//!
//! why: the `local://` snapshot backend, one directory per snapshot on the node's own disk
//! relations: implements the snapshot traits, persists meta tables through RecordFile
//! what: LocalSnapshotStorage, LocalSnapshotWriter, LocalSnapshotReader, LocalSnapshotCopier
//!
//! ```text
//! <dir>/temp_<n>/                    writers and copies in progress
//! <dir>/snapshot_<index:020>/        committed snapshots
//!        __raft_snapshot_meta        meta table: SnapshotMeta + file list
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{error, info, warn};
use parking_lot::Mutex;
use raft_core::{RaftError, Result, SnapshotMeta};
use serde::{Deserialize, Serialize};

use super::{
    missing_meta, parse_snapshot_dir_name, snapshot_dir_name, LocalFileMeta, Snapshot, SnapshotCopier,
    SnapshotReader, SnapshotStorage, SnapshotStorageFactory, SnapshotThrottle, SnapshotWriter, SNAPSHOT_META_FILE,
};
use crate::record::{sync_parent, RecordFile};
use crate::uri::{gc_dir, StorageUri};

const COPY_CHUNK_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MetaTable {
    meta: Option<SnapshotMeta>,
    files: BTreeMap<String, LocalFileMeta>,
}

impl MetaTable {
    fn load(dir: &Path) -> Result<Self> {
        RecordFile::new(dir.join(SNAPSHOT_META_FILE)).load()
    }

    fn save(&self, dir: &Path, sync: bool) -> Result<()> {
        RecordFile::new(dir.join(SNAPSHOT_META_FILE)).save(self, sync)
    }
}

fn remove_path(path: &Path) {
    let removed = match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    if let Err(e) = removed {
        error!("failed to remove {}: {}", path.display(), e);
    }
}

#[derive(Debug, Default)]
struct StorageState {
    last_snapshot_index: u64,
    /// readers per snapshot, the latest one also holds a reference of its own
    refs: BTreeMap<u64, usize>,
}

struct Inner {
    path: PathBuf,
    sync: bool,
    temp_seq: AtomicU64,
    state: Mutex<StorageState>,
    throttle: Mutex<Option<Arc<dyn SnapshotThrottle>>>,
}

impl Inner {
    fn snapshot_path(&self, index: u64) -> PathBuf {
        self.path.join(snapshot_dir_name(index))
    }

    fn unref_locked(&self, state: &mut StorageState, index: u64) {
        let remaining = match state.refs.get_mut(&index) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => return,
        };
        if remaining == 0 {
            state.refs.remove(&index);
            info!("removing snapshot {}", index);
            remove_path(&self.snapshot_path(index));
        }
    }

    fn unref(&self, index: u64) {
        let mut state = self.state.lock();
        self.unref_locked(&mut state, index);
    }
}

/// snapshots kept as directories under one root
#[derive(Clone)]
pub struct LocalSnapshotStorage {
    inner: Arc<Inner>,
}

impl fmt::Debug for LocalSnapshotStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSnapshotStorage")
            .field("path", &self.inner.path)
            .field("last_snapshot_index", &self.last_snapshot_index())
            .finish()
    }
}

impl LocalSnapshotStorage {
    pub fn new(path: impl AsRef<Path>, sync: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: path.as_ref().to_path_buf(),
                sync,
                temp_seq: AtomicU64::new(0),
                state: Mutex::new(StorageState::default()),
                throttle: Mutex::new(None),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn last_snapshot_index(&self) -> u64 {
        self.inner.state.lock().last_snapshot_index
    }

    fn create_writer(&self) -> Result<LocalSnapshotWriter> {
        let seq = self.inner.temp_seq.fetch_add(1, Ordering::Relaxed);
        let path = self.inner.path.join(format!("temp_{}", seq));
        remove_path(&path);
        fs::create_dir_all(&path)?;
        Ok(LocalSnapshotWriter { path, table: MetaTable::default(), sync: self.inner.sync })
    }

    /// publish the writer as `snapshot_<index>`; on failure its files are dropped
    fn commit(&self, writer: &mut dyn SnapshotWriter) -> Result<u64> {
        let result = self.try_commit(writer);
        if result.is_err() {
            remove_path(writer.path());
        }
        result
    }

    fn try_commit(&self, writer: &mut dyn SnapshotWriter) -> Result<u64> {
        let index = writer.snapshot_index();
        if index == 0 {
            return Err(RaftError::InvalidArgument("snapshot writer has no meta".into()));
        }
        writer.sync()?;

        let mut state = self.inner.state.lock();
        let target = self.inner.snapshot_path(index);
        if index == state.last_snapshot_index {
            info!("snapshot {} already exists, dropping the new copy", index);
            remove_path(writer.path());
            return Ok(index);
        }
        if target.exists() {
            return Err(RaftError::InvalidArgument(format!("snapshot {} is still referenced", index)));
        }
        fs::rename(writer.path(), &target)?;
        if self.inner.sync {
            sync_parent(&target)?;
        }
        *state.refs.entry(index).or_insert(0) += 1;
        let old = std::mem::replace(&mut state.last_snapshot_index, index);
        if old > 0 {
            self.inner.unref_locked(&mut state, old);
        }
        info!("committed snapshot {} at {}", index, target.display());
        Ok(index)
    }

    fn open_index(&self, index: u64) -> Result<LocalSnapshotReader> {
        {
            let mut state = self.inner.state.lock();
            match state.refs.get_mut(&index) {
                Some(count) => *count += 1,
                None => return Err(RaftError::NotFound(format!("snapshot {}", index))),
            }
        }
        let path = self.inner.snapshot_path(index);
        match MetaTable::load(&path) {
            Ok(table) => Ok(LocalSnapshotReader { inner: self.inner.clone(), index, path, table }),
            Err(e) => {
                self.inner.unref(index);
                Err(e)
            }
        }
    }
}

impl SnapshotStorage for LocalSnapshotStorage {
    fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.inner.path)?;
        let mut indexes = Vec::new();
        for dir_entry in fs::read_dir(&self.inner.path)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("temp") {
                info!("removing unfinished snapshot {}", name);
                remove_path(&dir_entry.path());
            } else if let Some(index) = parse_snapshot_dir_name(&name) {
                indexes.push(index);
            }
        }
        indexes.sort_unstable();
        let last = indexes.pop().unwrap_or(0);
        for stale in indexes {
            info!("removing stale snapshot {}", stale);
            remove_path(&self.inner.snapshot_path(stale));
        }

        let mut state = self.inner.state.lock();
        state.refs.clear();
        state.last_snapshot_index = last;
        if last > 0 {
            state.refs.insert(last, 1);
        }
        info!("snapshot storage {} initialized, last_snapshot_index={}", self.inner.path.display(), last);
        Ok(())
    }

    fn create(&self) -> Result<Box<dyn SnapshotWriter>> {
        Ok(Box::new(self.create_writer()?))
    }

    fn close_writer(&self, mut writer: Box<dyn SnapshotWriter>) -> Result<()> {
        self.commit(writer.as_mut()).map(|_| ())
    }

    fn discard_writer(&self, writer: Box<dyn SnapshotWriter>) -> Result<()> {
        remove_path(writer.path());
        Ok(())
    }

    fn open(&self) -> Option<Box<dyn SnapshotReader>> {
        let index = self.last_snapshot_index();
        if index == 0 {
            return None;
        }
        match self.open_index(index) {
            Ok(reader) => Some(Box::new(reader)),
            Err(e) => {
                error!("failed to open snapshot {}: {}", index, e);
                None
            }
        }
    }

    fn start_to_copy_from(&self, uri: &str) -> Result<Arc<dyn SnapshotCopier>> {
        let parsed = StorageUri::parse(uri)?;
        if parsed.scheme != "local" {
            return Err(RaftError::UnsupportedBackend(uri.to_string()));
        }
        let source = parsed.require_path()?;
        Ok(Arc::new(LocalSnapshotCopier::start(self.clone(), source)?))
    }

    fn set_snapshot_throttle(&self, throttle: Arc<dyn SnapshotThrottle>) {
        *self.inner.throttle.lock() = Some(throttle);
    }
}

/// fills a private `temp_<n>` directory
#[derive(Debug)]
pub struct LocalSnapshotWriter {
    path: PathBuf,
    table: MetaTable,
    sync: bool,
}

impl Snapshot for LocalSnapshotWriter {
    fn path(&self) -> &Path {
        &self.path
    }

    fn list_files(&self) -> Vec<String> {
        self.table.files.keys().cloned().collect()
    }

    fn file_meta(&self, name: &str) -> Option<LocalFileMeta> {
        self.table.files.get(name).cloned()
    }
}

impl SnapshotWriter for LocalSnapshotWriter {
    fn save_meta(&mut self, meta: SnapshotMeta) -> Result<()> {
        self.table.meta = Some(meta);
        Ok(())
    }

    fn add_file(&mut self, name: &str, meta: Option<LocalFileMeta>) -> Result<()> {
        check_file_name(name)?;
        self.table.files.insert(name.to_string(), meta.unwrap_or_default());
        Ok(())
    }

    fn remove_file(&mut self, name: &str) -> Result<()> {
        check_file_name(name)?;
        self.table.files.remove(name);
        match fs::remove_file(self.path.join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn sync(&mut self) -> Result<()> {
        self.table.save(&self.path, self.sync)
    }

    fn snapshot_index(&self) -> u64 {
        self.table.meta.as_ref().map_or(0, |m| m.last_included.index)
    }
}

/// file names stay inside the snapshot directory
fn check_file_name(name: &str) -> Result<()> {
    if name.is_empty() || name == SNAPSHOT_META_FILE || name.contains('/') || name.contains("..") {
        return Err(RaftError::InvalidArgument(format!("bad snapshot file name `{}`", name)));
    }
    Ok(())
}

/// pins a committed snapshot until dropped
pub struct LocalSnapshotReader {
    inner: Arc<Inner>,
    index: u64,
    path: PathBuf,
    table: MetaTable,
}

impl fmt::Debug for LocalSnapshotReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSnapshotReader").field("index", &self.index).field("path", &self.path).finish()
    }
}

impl LocalSnapshotReader {
    pub fn index(&self) -> u64 {
        self.index
    }
}

impl Snapshot for LocalSnapshotReader {
    fn path(&self) -> &Path {
        &self.path
    }

    fn list_files(&self) -> Vec<String> {
        self.table.files.keys().cloned().collect()
    }

    fn file_meta(&self, name: &str) -> Option<LocalFileMeta> {
        self.table.files.get(name).cloned()
    }
}

impl SnapshotReader for LocalSnapshotReader {
    fn load_meta(&self) -> Result<SnapshotMeta> {
        self.table.meta.clone().ok_or_else(|| missing_meta(&self.path))
    }

    fn generate_uri_for_copy(&self) -> String {
        format!("local://{}", self.path.display())
    }
}

impl Drop for LocalSnapshotReader {
    fn drop(&mut self) {
        self.inner.unref(self.index);
    }
}

/// returns the throttle's task slot however the copy ends
struct TaskSlot(Arc<dyn SnapshotThrottle>);

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.0.finish_one_task();
    }
}

/// copies a `local://` snapshot into a storage on a dedicated thread
pub struct LocalSnapshotCopier {
    cancelled: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<Result<LocalSnapshotReader>>>>,
}

impl fmt::Debug for LocalSnapshotCopier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSnapshotCopier")
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .finish()
    }
}

impl LocalSnapshotCopier {
    fn start(storage: LocalSnapshotStorage, source: PathBuf) -> Result<Self> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let handle = thread::Builder::new()
            .name("snapshot-copier".into())
            .spawn(move || copy_snapshot(&storage, &source, &flag))?;
        Ok(Self { cancelled, handle: Mutex::new(Some(handle)) })
    }
}

impl SnapshotCopier for LocalSnapshotCopier {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn join(&self) -> Result<Box<dyn SnapshotReader>> {
        let handle = self
            .handle
            .lock()
            .take()
            .ok_or_else(|| RaftError::InvalidArgument("snapshot copier already joined".into()))?;
        match handle.join() {
            Ok(result) => result.map(|reader| Box::new(reader) as Box<dyn SnapshotReader>),
            Err(_) => Err(RaftError::Io(io::Error::new(io::ErrorKind::Other, "snapshot copier panicked"))),
        }
    }
}

fn copy_snapshot(storage: &LocalSnapshotStorage, source: &Path, cancelled: &AtomicBool) -> Result<LocalSnapshotReader> {
    let throttle = storage.inner.throttle.lock().clone();
    let _slot = match &throttle {
        Some(t) if !t.add_one_more_task() => {
            return Err(RaftError::Busy("too many concurrent snapshot copies".into()));
        }
        Some(t) => Some(TaskSlot(t.clone())),
        None => None,
    };

    let table = MetaTable::load(source)?;
    let meta = table.meta.clone().ok_or_else(|| missing_meta(source))?;
    info!("copying snapshot {} from {}", meta.last_included, source.display());

    let mut writer = storage.create_writer()?;
    let filled = fill_writer(&mut writer, source, &table, meta, throttle.as_deref(), cancelled);
    if let Err(e) = filled {
        warn!("copy from {} failed: {}", source.display(), e);
        remove_path(writer.path());
        return Err(e);
    }
    let index = storage.commit(&mut writer)?;
    storage.open_index(index)
}

fn fill_writer(
    writer: &mut LocalSnapshotWriter,
    source: &Path,
    table: &MetaTable,
    meta: SnapshotMeta,
    throttle: Option<&dyn SnapshotThrottle>,
    cancelled: &AtomicBool,
) -> Result<()> {
    for (name, file_meta) in &table.files {
        check_file_name(name)?;
        copy_file(&source.join(name), &writer.path.join(name), file_meta, throttle, cancelled, writer.sync)?;
        writer.add_file(name, Some(file_meta.clone()))?;
    }
    if cancelled.load(Ordering::Acquire) {
        return Err(RaftError::Interrupted(format!("copy from {} cancelled", source.display())));
    }
    writer.save_meta(meta)
}

fn copy_file(
    src: &Path,
    dst: &Path,
    expected: &LocalFileMeta,
    throttle: Option<&dyn SnapshotThrottle>,
    cancelled: &AtomicBool,
    sync: bool,
) -> Result<()> {
    let mut input = File::open(src)?;
    let mut output = File::create(dst)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    loop {
        if cancelled.load(Ordering::Acquire) {
            return Err(RaftError::Interrupted(format!("copy of {} cancelled", src.display())));
        }
        let mut want = COPY_CHUNK_SIZE;
        if let Some(throttle) = throttle {
            let granted = throttle.throttled_by_throughput(want as u64) as usize;
            if granted == 0 {
                thread::sleep(throttle.check_interval());
                continue;
            }
            want = granted;
        }
        let n = input.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        output.write_all(&buf[..n])?;
    }
    if let Some(checksum) = expected.checksum {
        let actual = hasher.finalize();
        if actual != checksum {
            return Err(RaftError::Corrupted(format!(
                "{} checksum mismatch: expected {:08x}, got {:08x}",
                src.display(),
                checksum,
                actual
            )));
        }
    }
    if sync {
        output.sync_all()?;
    }
    Ok(())
}

/// `local://<dir>?sync=<bool>`
#[derive(Debug, Default)]
pub struct LocalSnapshotStorageFactory;

impl SnapshotStorageFactory for LocalSnapshotStorageFactory {
    fn new_instance(&self, uri: &StorageUri) -> Result<Arc<dyn SnapshotStorage>> {
        Ok(Arc::new(LocalSnapshotStorage::new(uri.require_path()?, uri.bool_param("sync", true)?)))
    }

    fn gc_instance(&self, uri: &StorageUri) -> Result<()> {
        gc_dir(uri.require_path()?)
    }
}
