//! # segmented
//!
//! why: the durable `local://` log backend
//! relations: built from Segment and RecordFile, registered under `local`
//! what: SegmentLogStorage, SegmentLogStorageFactory
//!
//! layout of the log directory:
//!
//! ```text
//! log_meta                        first_log_index, written through RecordFile
//! log_<first:020>_<last:020>      closed segments
//! log_inprogress_<first:020>      at most one open segment, always the tail
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::RwLock;
use raft_core::{ConfigurationManager, LogEntry, RaftError, Result};
use serde::{Deserialize, Serialize};

use super::segment::Segment;
use super::{in_range, LogStorage, LogStorageFactory};
use crate::record::RecordFile;
use crate::uri::{gc_dir, StorageUri};

pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 8 * 1024 * 1024;
const LOG_META_FILE: &str = "log_meta";

#[derive(Debug, Serialize, Deserialize)]
struct LogMeta {
    first_log_index: u64,
}

#[derive(Debug, Default)]
struct Segments {
    closed: BTreeMap<u64, Arc<Segment>>,
    open: Option<Arc<Segment>>,
}

impl Segments {
    /// the segment whose range may hold `index`
    fn locate(&self, index: u64) -> Option<Arc<Segment>> {
        if let Some(open) = &self.open {
            if index >= open.first_index() {
                return Some(open.clone());
            }
        }
        self.closed.range(..=index).next_back().map(|(_, s)| s.clone())
    }
}

/// log persisted as a directory of segment files
#[derive(Debug)]
pub struct SegmentLogStorage {
    path: PathBuf,
    enable_sync: bool,
    max_segment_size: u64,
    first_log_index: AtomicU64,
    last_log_index: AtomicU64,
    segments: RwLock<Segments>,
    meta: RecordFile,
}

impl SegmentLogStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_options(path, true, DEFAULT_MAX_SEGMENT_SIZE)
    }

    pub fn with_options(path: impl AsRef<Path>, enable_sync: bool, max_segment_size: u64) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            meta: RecordFile::new(path.join(LOG_META_FILE)),
            path,
            enable_sync,
            max_segment_size,
            first_log_index: AtomicU64::new(1),
            last_log_index: AtomicU64::new(0),
            segments: RwLock::new(Segments::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save_meta(&self, first_log_index: u64) -> Result<()> {
        self.meta.save(&LogMeta { first_log_index }, self.enable_sync)
    }

    /// scan the directory for segment files, oldest first
    fn list_segments(&self) -> Result<(Vec<Arc<Segment>>, Option<Arc<Segment>>)> {
        let mut closed = Vec::new();
        let mut open: Option<Arc<Segment>> = None;
        for dir_entry in fs::read_dir(&self.path)? {
            let name = dir_entry?.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };
            if name.starts_with(LOG_META_FILE) {
                continue;
            }
            if let Some(first) = name.strip_prefix("log_inprogress_") {
                let first: u64 = match first.parse() {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if first == 0 {
                    return Err(RaftError::Corrupted(format!("segment {} starts at index 0", name)));
                }
                if let Some(existing) = &open {
                    return Err(RaftError::Corrupted(format!(
                        "open segment conflict: {} and {}",
                        existing.first_index(),
                        first
                    )));
                }
                open = Some(Arc::new(Segment::new_open(&self.path, first)));
            } else if let Some(range) = name.strip_prefix("log_") {
                let parsed = range
                    .split_once('_')
                    .and_then(|(a, b)| Some((a.parse::<u64>().ok()?, b.parse::<u64>().ok()?)));
                match parsed {
                    Some((0, _)) => {
                        return Err(RaftError::Corrupted(format!("segment {} starts at index 0", name)));
                    }
                    Some((first, last)) if first <= last => {
                        closed.push(Arc::new(Segment::new_closed(&self.path, first, last)))
                    }
                    _ => warn!("ignoring unexpected file {} in {}", name, self.path.display()),
                }
            }
        }
        closed.sort_by_key(|s| s.first_index());
        Ok((closed, open))
    }

    /// the writable tail, created on demand and rolled once it outgrows `max_segment_size`
    fn open_segment(&self) -> Result<Arc<Segment>> {
        let mut segments = self.segments.write();
        if let Some(open) = &segments.open {
            if open.bytes() <= self.max_segment_size {
                return Ok(open.clone());
            }
            open.close(self.enable_sync)?;
            let sealed = open.clone();
            segments.closed.insert(sealed.first_index(), sealed);
            segments.open = None;
        }
        let segment = Arc::new(Segment::new_open(&self.path, self.last_log_index() + 1));
        segment.create()?;
        segments.open = Some(segment.clone());
        Ok(segment)
    }

    fn unlink_all(&self, doomed: Vec<Arc<Segment>>) -> Result<()> {
        let mut first_error = None;
        for segment in doomed {
            if let Err(e) = segment.unlink() {
                error!("failed to unlink segment {}: {}", segment.first_index(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl LogStorage for SegmentLogStorage {
    fn init(&self, configuration_manager: &ConfigurationManager) -> Result<()> {
        fs::create_dir_all(&self.path)?;
        let first_log_index = match self.meta.load_if_exists::<LogMeta>()? {
            Some(meta) => meta.first_log_index,
            None => 1,
        };

        let (closed, open) = self.list_segments()?;
        let mut segments = Segments::default();
        let mut doomed = Vec::new();
        let mut expected: Option<u64> = None;

        for segment in closed {
            if segment.last_index() < first_log_index {
                // left behind by a truncate_prefix that crashed after saving the meta
                doomed.push(segment);
                continue;
            }
            check_continuity(expected, first_log_index, &segment)?;
            segment.load(configuration_manager)?;
            expected = Some(segment.last_index() + 1);
            segments.closed.insert(segment.first_index(), segment);
        }

        if let Some(open) = open {
            check_continuity(expected, first_log_index, &open)?;
            open.load(configuration_manager)?;
            if open.last_index() < first_log_index {
                doomed.push(open);
            } else {
                expected = Some(open.last_index() + 1);
                segments.open = Some(open);
            }
        }
        self.unlink_all(doomed)?;

        let last_log_index = match expected {
            Some(next) => (next - 1).max(first_log_index - 1),
            None => first_log_index - 1,
        };
        self.first_log_index.store(first_log_index, Ordering::Release);
        self.last_log_index.store(last_log_index, Ordering::Release);
        *self.segments.write() = segments;

        info!(
            "log storage {} loaded, first_log_index={} last_log_index={}",
            self.path.display(),
            first_log_index,
            last_log_index
        );
        Ok(())
    }

    fn first_log_index(&self) -> u64 {
        self.first_log_index.load(Ordering::Acquire)
    }

    fn last_log_index(&self) -> u64 {
        self.last_log_index.load(Ordering::Acquire)
    }

    fn get_entry(&self, index: u64) -> Option<Arc<LogEntry>> {
        if !in_range(self.first_log_index(), self.last_log_index(), index) {
            return None;
        }
        let segment = self.segments.read().locate(index)?;
        match segment.get(index) {
            Ok(entry) => entry.map(Arc::new),
            Err(e) => {
                error!("failed to read entry {} from {}: {}", index, self.path.display(), e);
                None
            }
        }
    }

    fn get_term(&self, index: u64) -> u64 {
        if !in_range(self.first_log_index(), self.last_log_index(), index) {
            return 0;
        }
        self.segments.read().locate(index).map_or(0, |s| s.get_term(index))
    }

    fn append_entries(&self, entries: &[Arc<LogEntry>]) -> Result<usize> {
        let mut appended = 0;
        let mut failure = None;
        for entry in entries {
            let last = self.last_log_index();
            assert_eq!(
                entry.index(),
                last + 1,
                "non-contiguous append: last_log_index={}",
                last
            );
            let result = self.open_segment().and_then(|segment| segment.append(entry));
            if let Err(e) = result {
                failure = Some(e);
                break;
            }
            self.last_log_index.store(entry.index(), Ordering::Release);
            appended += 1;
        }

        if appended > 0 && self.enable_sync {
            let open = self.segments.read().open.clone();
            if let Some(open) = open {
                if let Err(e) = open.sync() {
                    error!("failed to sync {}: {}", self.path.display(), e);
                    return Err(e);
                }
            }
        }

        match failure {
            Some(e) if appended == 0 => Err(e),
            Some(e) => {
                error!(
                    "appended {} of {} entries to {}: {}",
                    appended,
                    entries.len(),
                    self.path.display(),
                    e
                );
                Ok(appended)
            }
            None => Ok(appended),
        }
    }

    fn truncate_prefix(&self, first_index_kept: u64) -> Result<()> {
        if first_index_kept <= self.first_log_index() {
            return Ok(());
        }
        // the meta goes first so a crash leaves only unlinkable leftovers
        self.save_meta(first_index_kept)?;
        self.first_log_index.store(first_index_kept, Ordering::Release);
        if self.last_log_index() < first_index_kept {
            self.last_log_index.store(first_index_kept - 1, Ordering::Release);
        }

        let mut doomed = Vec::new();
        {
            let mut segments = self.segments.write();
            while let Some((&first, segment)) = segments.closed.iter().next() {
                if segment.last_index() >= first_index_kept {
                    break;
                }
                doomed.push(segment.clone());
                segments.closed.remove(&first);
            }
            let open_is_stale = segments.open.as_ref().map_or(false, |o| o.last_index() < first_index_kept);
            if open_is_stale {
                doomed.extend(segments.open.take());
            }
        }
        self.unlink_all(doomed)
    }

    fn truncate_suffix(&self, last_index_kept: u64) -> Result<()> {
        let first = self.first_log_index();
        assert!(
            last_index_kept + 1 >= first,
            "truncate_suffix({}) below first_log_index {}",
            last_index_kept,
            first
        );
        if last_index_kept >= self.last_log_index() {
            return Ok(());
        }
        self.last_log_index.store(last_index_kept, Ordering::Release);

        let mut doomed = Vec::new();
        let mut partial = None;
        {
            let mut segments = self.segments.write();
            match segments.open.clone() {
                Some(open) if open.first_index() <= last_index_kept => partial = Some(open),
                Some(_) => doomed.extend(segments.open.take()),
                None => {}
            }
            if partial.is_none() {
                while let Some((&first, segment)) = segments.closed.iter().next_back() {
                    if first > last_index_kept {
                        doomed.push(segment.clone());
                        segments.closed.remove(&first);
                        continue;
                    }
                    if segment.last_index() > last_index_kept {
                        partial = Some(segment.clone());
                    }
                    break;
                }
            }
        }
        self.unlink_all(doomed)?;
        match partial {
            Some(segment) => segment.truncate(last_index_kept),
            None => Ok(()),
        }
    }

    fn reset(&self, next_log_index: u64) -> Result<()> {
        if next_log_index == 0 {
            return Err(RaftError::InvalidArgument("next_log_index must be positive".into()));
        }
        self.save_meta(next_log_index)?;
        let doomed: Vec<Arc<Segment>> = {
            let mut segments = self.segments.write();
            let mut all: Vec<Arc<Segment>> = std::mem::take(&mut segments.closed).into_values().collect();
            all.extend(segments.open.take());
            self.last_log_index.store(next_log_index - 1, Ordering::Release);
            self.first_log_index.store(next_log_index, Ordering::Release);
            all
        };
        info!("reset log {} to next_log_index={}", self.path.display(), next_log_index);
        self.unlink_all(doomed)
    }
}

/// each segment must start right after its predecessor, the oldest one no later than `first_log_index`
fn check_continuity(expected: Option<u64>, first_log_index: u64, segment: &Segment) -> Result<()> {
    match expected {
        Some(next) if segment.first_index() != next => Err(RaftError::Corrupted(format!(
            "gap between segments: expected {}, found {}",
            next,
            segment.first_index()
        ))),
        None if segment.first_index() > first_log_index => Err(RaftError::Corrupted(format!(
            "log starts at {} but first_log_index is {}",
            segment.first_index(),
            first_log_index
        ))),
        _ => Ok(()),
    }
}

/// `local://<dir>?sync=<bool>&max_segment_size=<bytes>`
#[derive(Debug, Default)]
pub struct SegmentLogStorageFactory;

impl LogStorageFactory for SegmentLogStorageFactory {
    fn new_instance(&self, uri: &StorageUri) -> Result<Arc<dyn LogStorage>> {
        let path = uri.require_path()?;
        let enable_sync = uri.bool_param("sync", true)?;
        let max_segment_size = uri.u64_param("max_segment_size", DEFAULT_MAX_SEGMENT_SIZE)?;
        Ok(Arc::new(SegmentLogStorage::with_options(path, enable_sync, max_segment_size)))
    }

    fn gc_instance(&self, uri: &StorageUri) -> Result<()> {
        gc_dir(uri.require_path()?)
    }
}
