//! # meta
//!
//! why: term and vote must be durable before a node answers any vote request
//! relations: created through the storage registry, file backends persist via RecordFile
//! what: RaftMetaStorage trait, local / local-merged / memory backends and their factories

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;
use raft_core::{PeerId, RaftError, Result};
use serde::{Deserialize, Serialize};

use crate::record::RecordFile;
use crate::uri::{gc_dir, StorageUri};

const STABLE_META_FILE: &str = "stable_meta";
const MERGED_META_FILE: &str = "merged_meta";

/// term a group starts from when nothing was ever persisted
pub const INITIAL_TERM: u64 = 1;

/// the persisted `{term, voted_for}` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StableMeta {
    pub term: u64,
    pub voted_for: PeerId,
}

impl Default for StableMeta {
    fn default() -> Self {
        Self { term: INITIAL_TERM, voted_for: PeerId::default() }
    }
}

/// durable term and vote, keyed by versioned group id
///
/// every call before `init` fails.
pub trait RaftMetaStorage: Send + Sync {
    /// idempotent
    fn init(&self) -> Result<()>;

    fn set_term_and_votedfor(&self, term: u64, voted_for: &PeerId, group: &str) -> Result<()>;

    /// `(INITIAL_TERM, PeerId::default())` for a group that never voted
    fn get_term_and_votedfor(&self, group: &str) -> Result<(u64, PeerId)>;
}

/// builds meta storages for one uri scheme
pub trait RaftMetaStorageFactory: Send + Sync {
    fn new_instance(&self, uri: &StorageUri) -> Result<Arc<dyn RaftMetaStorage>>;

    /// drop what `group` persisted under `uri`
    fn gc_instance(&self, uri: &StorageUri, group: &str) -> Result<()>;
}

fn not_initialized(what: &str) -> RaftError {
    RaftError::InvalidArgument(format!("{} is not initialized", what))
}

/// one `stable_meta` record per directory, serving a single group
#[derive(Debug)]
pub struct FileMetaStorage {
    path: PathBuf,
    record: RecordFile,
    sync: bool,
    meta: Mutex<Option<StableMeta>>,
}

impl FileMetaStorage {
    pub fn new(path: impl AsRef<Path>, sync: bool) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            record: RecordFile::new(path.join(STABLE_META_FILE)),
            path,
            sync,
            meta: Mutex::new(None),
        }
    }
}

impl RaftMetaStorage for FileMetaStorage {
    fn init(&self) -> Result<()> {
        let mut meta = self.meta.lock();
        if meta.is_some() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.path)?;
        let loaded = self.record.load_if_exists::<StableMeta>()?.unwrap_or_default();
        info!(
            "loaded raft meta from {}, term={} voted_for={}",
            self.path.display(),
            loaded.term,
            loaded.voted_for
        );
        *meta = Some(loaded);
        Ok(())
    }

    fn set_term_and_votedfor(&self, term: u64, voted_for: &PeerId, _group: &str) -> Result<()> {
        let mut meta = self.meta.lock();
        if meta.is_none() {
            return Err(not_initialized("raft meta storage"));
        }
        let next = StableMeta { term, voted_for: voted_for.clone() };
        self.record.save(&next, self.sync)?;
        *meta = Some(next);
        Ok(())
    }

    fn get_term_and_votedfor(&self, _group: &str) -> Result<(u64, PeerId)> {
        match &*self.meta.lock() {
            Some(meta) => Ok((meta.term, meta.voted_for.clone())),
            None => Err(not_initialized("raft meta storage")),
        }
    }
}

/// a single record shared by every group on a disk, keyed by versioned group id
#[derive(Debug)]
pub struct MergedMetaStorage {
    path: PathBuf,
    record: RecordFile,
    sync: bool,
    groups: Mutex<Option<BTreeMap<String, StableMeta>>>,
}

impl MergedMetaStorage {
    pub fn new(path: impl AsRef<Path>, sync: bool) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            record: RecordFile::new(path.join(MERGED_META_FILE)),
            path,
            sync,
            groups: Mutex::new(None),
        }
    }

    /// forget `group`; unknown groups are not an error
    pub fn delete(&self, group: &str) -> Result<()> {
        let mut guard = self.groups.lock();
        let groups = guard.as_mut().ok_or_else(|| not_initialized("merged meta storage"))?;
        if !groups.contains_key(group) {
            return Ok(());
        }
        let mut next = groups.clone();
        next.remove(group);
        self.record.save(&next, self.sync)?;
        *groups = next;
        info!("deleted raft meta of {} from {}", group, self.path.display());
        Ok(())
    }
}

impl RaftMetaStorage for MergedMetaStorage {
    fn init(&self) -> Result<()> {
        let mut groups = self.groups.lock();
        if groups.is_some() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.path)?;
        let loaded = self.record.load_if_exists::<BTreeMap<String, StableMeta>>()?.unwrap_or_default();
        info!("loaded merged raft meta of {} groups from {}", loaded.len(), self.path.display());
        *groups = Some(loaded);
        Ok(())
    }

    fn set_term_and_votedfor(&self, term: u64, voted_for: &PeerId, group: &str) -> Result<()> {
        let mut guard = self.groups.lock();
        let groups = guard.as_mut().ok_or_else(|| not_initialized("merged meta storage"))?;
        // the record is rewritten whole, the cache follows only once it is durable
        let mut next = groups.clone();
        next.insert(group.to_string(), StableMeta { term, voted_for: voted_for.clone() });
        self.record.save(&next, self.sync)?;
        *groups = next;
        Ok(())
    }

    fn get_term_and_votedfor(&self, group: &str) -> Result<(u64, PeerId)> {
        let guard = self.groups.lock();
        let groups = guard.as_ref().ok_or_else(|| not_initialized("merged meta storage"))?;
        let meta = groups.get(group).cloned().unwrap_or_default();
        Ok((meta.term, meta.voted_for))
    }
}

/// process-local meta, nothing survives
#[derive(Debug, Default)]
pub struct MemoryMetaStorage {
    groups: Mutex<Option<BTreeMap<String, StableMeta>>>,
}

impl MemoryMetaStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RaftMetaStorage for MemoryMetaStorage {
    fn init(&self) -> Result<()> {
        self.groups.lock().get_or_insert_with(BTreeMap::new);
        Ok(())
    }

    fn set_term_and_votedfor(&self, term: u64, voted_for: &PeerId, group: &str) -> Result<()> {
        let mut guard = self.groups.lock();
        let groups = guard.as_mut().ok_or_else(|| not_initialized("memory meta storage"))?;
        groups.insert(group.to_string(), StableMeta { term, voted_for: voted_for.clone() });
        Ok(())
    }

    fn get_term_and_votedfor(&self, group: &str) -> Result<(u64, PeerId)> {
        let guard = self.groups.lock();
        let groups = guard.as_ref().ok_or_else(|| not_initialized("memory meta storage"))?;
        let meta = groups.get(group).cloned().unwrap_or_default();
        Ok((meta.term, meta.voted_for))
    }
}

/// `local://<dir>?sync=<bool>`
#[derive(Debug, Default)]
pub struct FileMetaStorageFactory;

impl RaftMetaStorageFactory for FileMetaStorageFactory {
    fn new_instance(&self, uri: &StorageUri) -> Result<Arc<dyn RaftMetaStorage>> {
        Ok(Arc::new(FileMetaStorage::new(uri.require_path()?, uri.bool_param("sync", true)?)))
    }

    fn gc_instance(&self, uri: &StorageUri, _group: &str) -> Result<()> {
        gc_dir(uri.require_path()?)
    }
}

/// `local-merged://<dir>?sync=<bool>`
#[derive(Debug, Default)]
pub struct MergedMetaStorageFactory;

impl RaftMetaStorageFactory for MergedMetaStorageFactory {
    fn new_instance(&self, uri: &StorageUri) -> Result<Arc<dyn RaftMetaStorage>> {
        Ok(Arc::new(MergedMetaStorage::new(uri.require_path()?, uri.bool_param("sync", true)?)))
    }

    fn gc_instance(&self, uri: &StorageUri, group: &str) -> Result<()> {
        let storage = MergedMetaStorage::new(uri.require_path()?, uri.bool_param("sync", true)?);
        storage.init()?;
        storage.delete(group)
    }
}

/// `memory://`
#[derive(Debug, Default)]
pub struct MemoryMetaStorageFactory;

impl RaftMetaStorageFactory for MemoryMetaStorageFactory {
    fn new_instance(&self, _uri: &StorageUri) -> Result<Arc<dyn RaftMetaStorage>> {
        Ok(Arc::new(MemoryMetaStorage::new()))
    }

    fn gc_instance(&self, _uri: &StorageUri, _group: &str) -> Result<()> {
        Ok(())
    }
}
