//! # gradesync
//!
//! Keep a student-grades table consistent across several independently
//! written stores.
//!
//! Every participating store is wrapped in a [`Replica`]. A replica records
//! each `GET` and `SET` it serves in its own [`OperationLog`], and remembers
//! when it last merged with each peer. Merging pulls the peer's writes made
//! since that bookmark and applies them under a last-writer-wins rule: a
//! write is only accepted if it is newer than the replica's own latest
//! write for the same key.
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use gradesync::prelude::*;
//!
//! let clock = Arc::new(WallClock::new());
//! let mut pg = Replica::in_memory("postgresql", clock.clone());
//! let mut mongo = Replica::in_memory("mongodb", clock);
//!
//! let key = Key::new("SID1033", "CSE016");
//! mongo.set(&key, "A").unwrap();
//!
//! let report = pg.merge_from(&mut mongo).unwrap();
//! assert_eq!(report.applied, 1);
//! assert_eq!(pg.get(&key).unwrap().as_deref(), Some("A"));
//! ```
//!
//! ## Stores
//!
//! [`MemoryStore`] ships here. SQLite, redb, and batch-file adapters live in
//! the `gradesync-store` crate; anything else only needs to implement
//! [`GradeStore`].
//!
//! ## Persistence
//!
//! [`OperationLog::open`] keeps the log and merge history of one replica as
//! two JSON files (`oplog_<name>.json`, `merge_history_<name>.json`) and
//! rewrites them after every change, so a restarted process resumes where
//! the last one stopped.

#![warn(missing_docs)]

mod error;
mod merge;
mod op;
mod oplog;
mod registry;
mod replica;
mod store;

pub mod clock;
pub mod prelude;

pub use error::{PersistenceError, ReplicaError};
pub use merge::MergeReport;
pub use op::{Key, OpKind, Operation, Origin};
pub use oplog::{history_path, log_path, MergeHistory, OperationLog};
pub use registry::ReplicaSet;
pub use replica::Replica;
pub use store::{GradeStore, MemoryStore, StoreError};
