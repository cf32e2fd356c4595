use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::store::StoreError;

/// The log or merge history could not be written to (or read from) disk.
#[derive(Debug)]
pub enum PersistenceError {
    /// File system failure on `path`.
    Io {
        /// File being read or written.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// The in-memory state could not be encoded.
    Json(serde_json::Error),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Json(e) => write!(f, "encoding error: {e}"),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Json(e) => Some(e),
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// Error type for replica operations.
///
/// "Not found" is not an error: [`Replica::get`](crate::Replica::get)
/// returns `Ok(None)` for a missing key, and a merge candidate that loses
/// the last-writer-wins comparison is counted, not reported.
#[derive(Debug)]
pub enum ReplicaError {
    /// The backing store failed a read or write.
    Storage(StoreError),
    /// The operation log or merge history could not be saved.
    Persistence(PersistenceError),
    /// Unknown peer, self-merge, or a malformed key or value.
    Misuse(String),
}

impl fmt::Display for ReplicaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage failure: {e}"),
            Self::Persistence(e) => write!(f, "persistence failure: {e}"),
            Self::Misuse(msg) => write!(f, "invalid request: {msg}"),
        }
    }
}

impl std::error::Error for ReplicaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Persistence(e) => Some(e),
            Self::Misuse(_) => None,
        }
    }
}

impl From<StoreError> for ReplicaError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e)
    }
}

impl From<PersistenceError> for ReplicaError {
    fn from(e: PersistenceError) -> Self {
        Self::Persistence(e)
    }
}
