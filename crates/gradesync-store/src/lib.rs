//! # gradesync-store
//!
//! Storage backends for [`gradesync`] replicas.
//!
//! Each backend implements [`GradeStore`]: read and upsert one grade per
//! `(student_id, course_id)` key. The replica never sees anything else of
//! the backend.
//!
//! ## Backends
//!
//! | Backend | Feature flag | Shape |
//! |---------|-------------|-------|
//! | [`MemoryStore`] | *(always available)* | `BTreeMap`, tests and prototyping |
//! | `SqliteStore` | `sqlite` | relational `grades` table |
//! | `RedbStore` | `redb` | postcard-encoded [`GradeDocument`] per key |
//! | [`BatchFileStore`] | *(always available)* | tab-separated part file, replaced whole on write |
//!
//! ## Choosing a backend at startup
//!
//! ```
//! use gradesync::Key;
//! use gradesync_store::{open_store, BackendKind, GradeStore};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let kind: BackendKind = "batch".parse().unwrap();
//! let mut store = open_store(kind, &dir.path().join("grades")).unwrap();
//! store.set(&Key::new("s1", "c1"), "A").unwrap();
//! assert_eq!(store.backend(), "batch");
//! ```

#![warn(missing_docs)]

mod batch;
mod document;
#[cfg(feature = "redb")]
mod redb;
#[cfg(feature = "sqlite")]
mod sqlite;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

pub use batch::{BatchError, BatchFileStore, PART_FILE};
pub use document::GradeDocument;
pub use gradesync::{GradeStore, MemoryStore, StoreError};
#[cfg(feature = "redb")]
pub use self::redb::{RedbError, RedbStore};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteError, SqliteStore};

/// The storage technology behind a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// [`MemoryStore`]; contents are lost on exit.
    Memory,
    /// `SqliteStore`.
    Sqlite,
    /// `RedbStore`.
    Redb,
    /// [`BatchFileStore`].
    Batch,
}

impl BackendKind {
    /// All variants, in declaration order.
    pub const ALL: [BackendKind; 4] = [Self::Memory, Self::Sqlite, Self::Redb, Self::Batch];

    /// Lowercase name, as written in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
            Self::Redb => "redb",
            Self::Batch => "batch",
        }
    }

    /// `true` if this build can open the backend.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Memory | Self::Batch => true,
            Self::Sqlite => cfg!(feature = "sqlite"),
            Self::Redb => cfg!(feature = "redb"),
        }
    }

    /// Where a replica's store lives under `data_dir` when no path is
    /// configured.
    pub fn default_path(&self, data_dir: &Path, replica: &str) -> PathBuf {
        let replica = replica.to_lowercase();
        match self {
            Self::Memory => PathBuf::new(),
            Self::Sqlite => data_dir.join(format!("{replica}.db")),
            Self::Redb => data_dir.join(format!("{replica}.redb")),
            Self::Batch => data_dir.join(format!("{replica}_data")).join("grades"),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised backend name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownBackend(pub String);

impl fmt::Display for UnknownBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown backend {:?} (expected memory, sqlite, redb, or batch)",
            self.0
        )
    }
}

impl std::error::Error for UnknownBackend {}

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownBackend(s.to_string()))
    }
}

/// Open the store for `kind` at `path`. `path` is ignored for
/// [`BackendKind::Memory`].
///
/// Parent directories are created as needed. A backend whose feature is
/// not compiled in fails here, once, rather than on first use.
pub fn open_store(kind: BackendKind, path: &Path) -> Result<Box<dyn GradeStore>, StoreError> {
    if kind != BackendKind::Memory {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::new(kind.as_str(), e))?;
        }
    }

    let store: Box<dyn GradeStore> = match kind {
        BackendKind::Memory => Box::new(MemoryStore::new()),
        BackendKind::Batch => Box::new(BatchFileStore::open(path)?),
        #[cfg(feature = "sqlite")]
        BackendKind::Sqlite => Box::new(SqliteStore::open(path)?),
        #[cfg(feature = "redb")]
        BackendKind::Redb => Box::new(RedbStore::open(path)?),
        #[allow(unreachable_patterns)]
        other => {
            return Err(StoreError::new(
                other.as_str(),
                format!("backend not compiled in; enable the `{other}` feature"),
            ))
        }
    };
    tracing::debug!(backend = %kind, "opened store at {}", path.display());
    Ok(store)
}
