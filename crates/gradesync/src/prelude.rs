//! Convenient re-exports for common usage.
//!
//! ```
//! use gradesync::prelude::*;
//! ```

pub use crate::clock::{Clock, Timestamp, WallClock};
pub use crate::GradeStore;
pub use crate::Key;
pub use crate::MemoryStore;
pub use crate::Replica;
pub use crate::ReplicaError;
pub use crate::ReplicaSet;
