//! The capability a replica needs from its backing store.
//!
//! A replica only ever reads or writes one value per [`Key`]. Everything
//! else about the backend (schema, connections, files) stays behind
//! [`GradeStore`]; concrete adapters live in the `gradesync-store` crate.

use std::collections::BTreeMap;
use std::fmt;

use crate::op::Key;

/// A backend failed to complete a read or write.
#[derive(Debug)]
pub struct StoreError {
    backend: &'static str,
    source: Box<dyn std::error::Error + Send + Sync>,
}

impl StoreError {
    /// Wrap a backend error.
    pub fn new(
        backend: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            backend,
            source: source.into(),
        }
    }

    /// Name of the backend that failed.
    pub fn backend(&self) -> &'static str {
        self.backend
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} store: {}", self.backend, self.source)
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Key-value capability consumed by a [`Replica`](crate::Replica).
///
/// Implementations must not fail for a missing key (`get` returns
/// `Ok(None)`), and `set` must either write the value or return an error.
pub trait GradeStore: Send {
    /// Short backend name for logs and status output.
    fn backend(&self) -> &'static str;

    /// Read the current value for `key`.
    fn get(&self, key: &Key) -> Result<Option<String>, StoreError>;

    /// Insert or overwrite the value for `key`.
    fn set(&mut self, key: &Key, value: &str) -> Result<(), StoreError>;
}

impl<S: GradeStore + ?Sized> GradeStore for Box<S> {
    fn backend(&self) -> &'static str {
        (**self).backend()
    }

    fn get(&self, key: &Key) -> Result<Option<String>, StoreError> {
        (**self).get(key)
    }

    fn set(&mut self, key: &Key, value: &str) -> Result<(), StoreError> {
        (**self).set(key, value)
    }
}

/// In-memory store backed by a `BTreeMap`.
///
/// ```
/// use gradesync::{GradeStore, Key, MemoryStore};
///
/// let mut store = MemoryStore::new();
/// store.set(&Key::new("s1", "c1"), "A").unwrap();
/// assert_eq!(store.get(&Key::new("s1", "c1")).unwrap().as_deref(), Some("A"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    grades: BTreeMap<Key, String>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.grades.len()
    }

    /// `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.grades.is_empty()
    }

    /// Iterate over all records in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &str)> {
        self.grades.iter().map(|(k, v)| (k, v.as_str()))
    }
}

impl GradeStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &Key) -> Result<Option<String>, StoreError> {
        Ok(self.grades.get(key).cloned())
    }

    fn set(&mut self, key: &Key, value: &str) -> Result<(), StoreError> {
        self.grades.insert(key.clone(), value.to_string());
        Ok(())
    }
}
