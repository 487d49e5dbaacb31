//! # error
//!
//! why: one error type shared by storage, snapshot and timer code
//! relations: returned by every fallible operation in the workspace
//! what: RaftError taxonomy (i/o, protocol outcomes, startup corruption) and Result alias

use thiserror::Error;

use crate::log::LogId;

/// Errors surfaced by the raft core.
///
/// Protocol outcomes (`TermMismatch`, `Interrupted`, `Busy`) are expected and
/// recoverable; callers match on them instead of treating them as failures.
#[derive(Debug, Error)]
pub enum RaftError {
    /// File open/read/write/sync/rename failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// On-disk state failed validation (checksum, short read, gap)
    #[error("corrupted data: {0}")]
    Corrupted(String),

    #[error("unsupported storage backend `{0}`")]
    UnsupportedBackend(String),

    #[error("invalid uri `{0}`")]
    InvalidUri(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration history only grows at its tail
    #[error("stale configuration insert: {entry} is not after {last}")]
    StaleInsert { entry: LogId, last: LogId },

    /// The request comes from a leader whose term is behind ours
    #[error("term mismatch: request term {request_term}, current term {current_term}")]
    TermMismatch { request_term: u64, current_term: u64 },

    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("stopped")]
    Stopped,

    #[error("not found: {0}")]
    NotFound(String),
}

impl RaftError {
    /// True for the outcomes the caller is expected to retry or ignore.
    pub fn is_protocol_outcome(&self) -> bool {
        matches!(
            self,
            RaftError::TermMismatch { .. } | RaftError::Interrupted(_) | RaftError::Busy(_)
        )
    }
}

impl From<serde_json::Error> for RaftError {
    fn from(e: serde_json::Error) -> Self {
        RaftError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_outcomes_are_distinguishable() {
        assert!(RaftError::Busy("saving".into()).is_protocol_outcome());
        assert!(RaftError::Interrupted("newer leader".into()).is_protocol_outcome());
        assert!(RaftError::TermMismatch { request_term: 1, current_term: 2 }.is_protocol_outcome());
        assert!(!RaftError::Stopped.is_protocol_outcome());
    }

    #[test]
    fn io_errors_convert() {
        let err: RaftError = std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into();
        assert!(matches!(err, RaftError::Io(_)));
        assert!(err.to_string().contains("disk gone"));
    }
}
