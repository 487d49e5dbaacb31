//! # log
//!
//! why: identify and carry the entries of the replicated log
//! relations: stored by raft-storage log backends, consumed by configuration history
//! what: LogId (total order by index then term), EntryType, LogEntry

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::configuration::PeerId;
use crate::error::RaftError;

/// Position of an entry in the log.
///
/// Field order matters: the derived `Ord` compares `index` first, then `term`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogId {
    pub index: u64,
    pub term: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { index, term }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(index={},term={})", self.index, self.term)
    }
}

/// Kind of a log entry, with the tag used by the segment file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryType {
    NoOp = 1,
    Data = 2,
    Configuration = 3,
}

impl TryFrom<u8> for EntryType {
    type Error = RaftError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EntryType::NoOp),
            2 => Ok(EntryType::Data),
            3 => Ok(EntryType::Configuration),
            other => Err(RaftError::Corrupted(format!("unknown entry type {}", other))),
        }
    }
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: LogId,
    pub entry_type: EntryType,
    /// The command to be applied to the state machine
    pub data: Vec<u8>,
    /// New membership, set on configuration entries
    pub peers: Option<Vec<PeerId>>,
    /// Membership being replaced, set while joint consensus is in progress
    pub old_peers: Option<Vec<PeerId>>,
}

impl LogEntry {
    /// Create a new data entry
    pub fn new(term: u64, index: u64, data: Vec<u8>) -> Self {
        Self {
            id: LogId::new(term, index),
            entry_type: EntryType::Data,
            data,
            peers: None,
            old_peers: None,
        }
    }

    /// Entry a fresh leader appends at the start of its term
    pub fn no_op(term: u64, index: u64) -> Self {
        Self {
            id: LogId::new(term, index),
            entry_type: EntryType::NoOp,
            data: Vec::new(),
            peers: None,
            old_peers: None,
        }
    }

    /// Membership change entry; `old_peers` is `Some` during joint consensus
    pub fn configuration(term: u64, index: u64, peers: Vec<PeerId>, old_peers: Option<Vec<PeerId>>) -> Self {
        Self {
            id: LogId::new(term, index),
            entry_type: EntryType::Configuration,
            data: Vec::new(),
            peers: Some(peers),
            old_peers,
        }
    }

    pub fn term(&self) -> u64 {
        self.id.term
    }

    pub fn index(&self) -> u64 {
        self.id.index
    }

    pub fn is_configuration(&self) -> bool {
        self.entry_type == EntryType::Configuration
    }
}
