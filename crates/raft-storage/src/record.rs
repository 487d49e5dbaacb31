//! # record
//!
//! why: small metadata blobs must never be observed half-written
//! relations: backs the local meta storages, the segment log meta and snapshot meta tables
//! what: RecordFile, `[u32 be length][json payload]` written via `path.tmp` + rename

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::warn;
use raft_core::{RaftError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// a single serialized message stored atomically at `path`
#[derive(Debug, Clone)]
pub struct RecordFile {
    path: PathBuf,
}

impl RecordFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// serialize `message` into `path.tmp`, optionally fsync, then rename over `path`
    pub fn save<M: Serialize>(&self, message: &M, sync: bool) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| RaftError::InvalidArgument(format!("record of {} bytes is too large", payload.len())))?;

        let tmp = self.tmp_path();
        if let Err(e) = write_tmp(&tmp, len, &payload, sync) {
            // the target is untouched; drop the partial temp file
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        fs::rename(&tmp, &self.path)?;
        if sync {
            sync_parent(&self.path)?;
        }
        Ok(())
    }

    /// read the length prefix, exactly that many payload bytes, then parse
    pub fn load<M: DeserializeOwned>(&self) -> Result<M> {
        let mut file = File::open(&self.path)?;
        let len = file.read_u32::<BigEndian>().map_err(|e| short_read(&self.path, e))?;
        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload).map_err(|e| short_read(&self.path, e))?;
        serde_json::from_slice(&payload).map_err(|e| {
            RaftError::Corrupted(format!("failed to parse {}: {}", self.path.display(), e))
        })
    }

    /// like `load`, but a missing file is `None`
    pub fn load_if_exists<M: DeserializeOwned>(&self) -> Result<Option<M>> {
        match self.load() {
            Ok(m) => Ok(Some(m)),
            Err(RaftError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn write_tmp(tmp: &Path, len: u32, payload: &[u8], sync: bool) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(tmp)?;
    file.write_u32::<BigEndian>(len)?;
    file.write_all(payload)?;
    if sync {
        file.sync_all()?;
    }
    Ok(())
}

fn short_read(path: &Path, e: io::Error) -> RaftError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        RaftError::Corrupted(format!("short read on {}", path.display()))
    } else {
        RaftError::Io(e)
    }
}

/// make a rename durable by syncing the directory holding it
pub(crate) fn sync_parent(path: &Path) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    match File::open(parent).and_then(|dir| dir.sync_all()) {
        Ok(()) => Ok(()),
        // some platforms refuse to fsync directories
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            warn!("cannot sync directory {}: {}", parent.display(), e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
