//! # uri
//!
//! why: backends are chosen and parameterised by `scheme://path[?params]` strings
//! relations: used by the storage registry and by every backend constructor
//! what: parse_uri, StorageUri, gc_dir

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{info, warn};
use raft_core::{RaftError, Result};

/// split `${protocol}://${parameters}`, dropping whitespace from the parameters
pub fn parse_uri(uri: &str) -> Option<(&str, String)> {
    let pos = uri.find("://")?;
    let protocol = uri[..pos].trim();
    let rest = &uri[pos + 3..];
    let parameter: String = rest.chars().filter(|c| !c.is_whitespace()).collect();
    let removed = rest.chars().count() - parameter.chars().count();
    if removed > 0 {
        warn!("removed {} spaces from `{}`", removed, rest);
    }
    Some((protocol, parameter))
}

/// parsed backend uri
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUri {
    pub scheme: String,
    pub path: String,
    pub params: BTreeMap<String, String>,
}

impl StorageUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, parameter) = parse_uri(uri).ok_or_else(|| RaftError::InvalidUri(uri.to_string()))?;
        if scheme.is_empty() {
            return Err(RaftError::InvalidUri(uri.to_string()));
        }
        let (path, query) = match parameter.split_once('?') {
            Some((path, query)) => (path.to_string(), query),
            None => (parameter, ""),
        };
        let mut params = BTreeMap::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            params.insert(key.to_string(), value.to_string());
        }
        Ok(Self { scheme: scheme.to_string(), path, params })
    }

    pub fn path_buf(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }

    /// backends that live on disk need somewhere to live
    pub fn require_path(&self) -> Result<PathBuf> {
        if self.path.is_empty() {
            return Err(RaftError::InvalidUri(format!("{}:// needs a path", self.scheme)));
        }
        Ok(self.path_buf())
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn bool_param(&self, key: &str, default: bool) -> Result<bool> {
        match self.param(key) {
            None => Ok(default),
            Some("true") | Some("1") => Ok(true),
            Some("false") | Some("0") => Ok(false),
            Some(other) => Err(RaftError::InvalidArgument(format!("{}={} is not a bool", key, other))),
        }
    }

    pub fn u64_param(&self, key: &str, default: u64) -> Result<u64> {
        match self.param(key) {
            None => Ok(default),
            Some(v) => v
                .parse()
                .map_err(|_| RaftError::InvalidArgument(format!("{}={} is not a number", key, v))),
        }
    }
}

/// remove a directory tree crash-safely: rename to `path.tmp` first, then delete
pub fn gc_dir(path: impl AsRef<Path>) -> Result<()> {
    let target = path.as_ref();
    let mut tmp = target.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    // garbage from an earlier crash
    remove_all(&tmp)?;
    if target.exists() {
        fs::rename(target, &tmp)?;
        remove_all(&tmp)?;
    } else {
        info!("target path {} does not exist, nothing to gc", target.display());
    }
    Ok(())
}

fn remove_all(path: &Path) -> io::Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_uri_splits_protocol() {
        let (protocol, parameter) = parse_uri(" local ://./data/ log").unwrap();
        assert_eq!(protocol, "local");
        assert_eq!(parameter, "./data/log");
        assert!(parse_uri("no-scheme").is_none());
    }

    #[test]
    fn storage_uri_reads_query_params() {
        let uri = StorageUri::parse("local://data/log?sync=false&max_segment_size=1024").unwrap();
        assert_eq!(uri.scheme, "local");
        assert_eq!(uri.path, "data/log");
        assert!(!uri.bool_param("sync", true).unwrap());
        assert_eq!(uri.u64_param("max_segment_size", 0).unwrap(), 1024);
        assert_eq!(uri.u64_param("missing", 7).unwrap(), 7);
        assert!(uri.bool_param("max_segment_size", true).is_err());
    }

    #[test]
    fn storage_uri_rejects_missing_scheme() {
        assert!(matches!(StorageUri::parse("://x"), Err(RaftError::InvalidUri(_))));
        assert!(matches!(StorageUri::parse("data/log"), Err(RaftError::InvalidUri(_))));
        assert!(StorageUri::parse("memory://").unwrap().require_path().is_err());
    }

    #[test]
    fn gc_dir_removes_tree_and_garbage() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("group");
        fs::create_dir_all(target.join("nested")).unwrap();
        fs::write(target.join("nested/file"), b"x").unwrap();
        fs::write(dir.path().join("group.tmp"), b"garbage").unwrap();

        gc_dir(&target).unwrap();
        assert!(!target.exists());
        assert!(!dir.path().join("group.tmp").exists());
        // idempotent
        gc_dir(&target).unwrap();
    }
}
