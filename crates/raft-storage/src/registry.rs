//! # registry
//!
//! why: nodes name their storages by uri, so someone has to map schemes to backends
//! relations: owns the factories of the log, meta and snapshot modules
//! what: StorageRegistry

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::info;
use raft_core::{RaftError, Result};

use crate::log::{LogStorage, LogStorageFactory, MemoryLogStorageFactory, SegmentLogStorageFactory};
use crate::meta::{
    FileMetaStorageFactory, MemoryMetaStorageFactory, MergedMetaStorageFactory, RaftMetaStorage,
    RaftMetaStorageFactory,
};
use crate::snapshot::{LocalSnapshotStorageFactory, SnapshotStorage, SnapshotStorageFactory};
use crate::uri::StorageUri;

/// scheme -> factory, one table per storage kind
///
/// an explicit object rather than process-wide state; build it once at
/// startup with `with_defaults` and register extra backends before sharing it.
#[derive(Default)]
pub struct StorageRegistry {
    log: HashMap<String, Arc<dyn LogStorageFactory>>,
    meta: HashMap<String, Arc<dyn RaftMetaStorageFactory>>,
    snapshot: HashMap<String, Arc<dyn SnapshotStorageFactory>>,
}

impl fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut log: Vec<_> = self.log.keys().collect();
        let mut meta: Vec<_> = self.meta.keys().collect();
        let mut snapshot: Vec<_> = self.snapshot.keys().collect();
        log.sort();
        meta.sort();
        snapshot.sort();
        f.debug_struct("StorageRegistry")
            .field("log", &log)
            .field("meta", &meta)
            .field("snapshot", &snapshot)
            .finish()
    }
}

fn register<F: ?Sized>(table: &mut HashMap<String, Arc<F>>, kind: &str, scheme: &str, factory: Arc<F>) -> Result<()> {
    if table.contains_key(scheme) {
        return Err(RaftError::InvalidArgument(format!("{} storage `{}` is already registered", kind, scheme)));
    }
    info!("registered {} storage `{}`", kind, scheme);
    table.insert(scheme.to_string(), factory);
    Ok(())
}

fn lookup<'a, F: ?Sized>(table: &'a HashMap<String, Arc<F>>, uri: &str) -> Result<(&'a F, StorageUri)> {
    let parsed = StorageUri::parse(uri)?;
    let factory = table
        .get(&parsed.scheme)
        .ok_or_else(|| RaftError::UnsupportedBackend(parsed.scheme.clone()))?;
    Ok((factory.as_ref(), parsed))
}

impl StorageRegistry {
    /// an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// the built-in backends: log `local` and `memory`, meta `local`,
    /// `local-merged` and `memory`, snapshot `local`
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.log.insert("local".into(), Arc::new(SegmentLogStorageFactory));
        registry.log.insert("memory".into(), Arc::new(MemoryLogStorageFactory));
        registry.meta.insert("local".into(), Arc::new(FileMetaStorageFactory));
        registry.meta.insert("local-merged".into(), Arc::new(MergedMetaStorageFactory));
        registry.meta.insert("memory".into(), Arc::new(MemoryMetaStorageFactory));
        registry.snapshot.insert("local".into(), Arc::new(LocalSnapshotStorageFactory));
        registry
    }

    pub fn register_log_storage(&mut self, scheme: &str, factory: Arc<dyn LogStorageFactory>) -> Result<()> {
        register(&mut self.log, "log", scheme, factory)
    }

    pub fn register_meta_storage(&mut self, scheme: &str, factory: Arc<dyn RaftMetaStorageFactory>) -> Result<()> {
        register(&mut self.meta, "meta", scheme, factory)
    }

    pub fn register_snapshot_storage(&mut self, scheme: &str, factory: Arc<dyn SnapshotStorageFactory>) -> Result<()> {
        register(&mut self.snapshot, "snapshot", scheme, factory)
    }

    pub fn create_log_storage(&self, uri: &str) -> Result<Arc<dyn LogStorage>> {
        let (factory, parsed) = lookup(&self.log, uri)?;
        factory.new_instance(&parsed)
    }

    pub fn create_meta_storage(&self, uri: &str) -> Result<Arc<dyn RaftMetaStorage>> {
        let (factory, parsed) = lookup(&self.meta, uri)?;
        factory.new_instance(&parsed)
    }

    pub fn create_snapshot_storage(&self, uri: &str) -> Result<Arc<dyn SnapshotStorage>> {
        let (factory, parsed) = lookup(&self.snapshot, uri)?;
        factory.new_instance(&parsed)
    }

    /// remove everything the log at `uri` persisted
    pub fn destroy_log_storage(&self, uri: &str) -> Result<()> {
        let (factory, parsed) = lookup(&self.log, uri)?;
        factory.gc_instance(&parsed)
    }

    /// remove the term and vote `group` persisted at `uri`
    pub fn destroy_meta_storage(&self, uri: &str, group: &str) -> Result<()> {
        let (factory, parsed) = lookup(&self.meta, uri)?;
        factory.gc_instance(&parsed, group)
    }

    pub fn destroy_snapshot_storage(&self, uri: &str) -> Result<()> {
        let (factory, parsed) = lookup(&self.snapshot, uri)?;
        factory.gc_instance(&parsed)
    }
}
