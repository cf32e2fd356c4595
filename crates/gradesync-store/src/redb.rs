//! Document backend using [`redb`](https://docs.rs/redb).
//!
//! Each grade is one [`GradeDocument`], postcard-encoded and stored under
//! the key `student_id \0 course_id`. Every `set` is a read-modify-write in
//! its own write transaction, so the other document fields survive an
//! update.
//!
//! Enable with `features = ["redb"]`.
//!
//! ```no_run
//! use gradesync::{GradeStore, Key};
//! use gradesync_store::RedbStore;
//!
//! let mut store = RedbStore::open("state/mongodb.redb").unwrap();
//! store.set(&Key::new("SID1033", "CSE016"), "A").unwrap();
//! ```

use std::path::Path;

use gradesync::{GradeStore, Key, StoreError};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};

use crate::document::GradeDocument;

const GRADES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("grades");

/// Errors returned by [`RedbStore`] operations.
#[derive(Debug)]
pub struct RedbError(String);

impl std::fmt::Display for RedbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for RedbError {}

impl From<RedbError> for StoreError {
    fn from(e: RedbError) -> Self {
        StoreError::new(RedbStore::BACKEND, e)
    }
}

fn err(e: impl std::fmt::Display) -> RedbError {
    RedbError(e.to_string())
}

fn document_key(key: &Key) -> String {
    format!("{}\0{}", key.student_id, key.course_id)
}

/// Grade documents in a redb database.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Backend name reported in logs and errors.
    pub const BACKEND: &'static str = "redb";

    /// Open or create a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RedbError> {
        let db = Database::create(path).map_err(err)?;
        Self::with_database(db)
    }

    /// Create an in-memory database.
    pub fn open_in_memory() -> Result<Self, RedbError> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(err)?;
        Self::with_database(db)
    }

    fn with_database(db: Database) -> Result<Self, RedbError> {
        // Ensure the table exists so reads never see TableDoesNotExist.
        let txn = db.begin_write().map_err(err)?;
        txn.open_table(GRADES_TABLE).map_err(err)?;
        txn.commit().map_err(err)?;
        Ok(Self { db })
    }

    /// The full document for `key`.
    pub fn document(&self, key: &Key) -> Result<Option<GradeDocument>, RedbError> {
        let txn = self.db.begin_read().map_err(err)?;
        let table = txn.open_table(GRADES_TABLE).map_err(err)?;
        match table.get(document_key(key).as_str()).map_err(err)? {
            Some(guard) => Ok(Some(GradeDocument::from_bytes(guard.value()).map_err(err)?)),
            None => Ok(None),
        }
    }

    /// Store `doc` as is, replacing any existing document for its key.
    pub fn put_document(&mut self, doc: &GradeDocument) -> Result<(), RedbError> {
        let bytes = doc.to_bytes().map_err(err)?;
        let txn = self.db.begin_write().map_err(err)?;
        {
            let mut table = txn.open_table(GRADES_TABLE).map_err(err)?;
            table
                .insert(document_key(&doc.key()).as_str(), bytes.as_slice())
                .map_err(err)?;
        }
        txn.commit().map_err(err)?;
        Ok(())
    }

    /// Number of stored documents.
    pub fn len(&self) -> Result<usize, RedbError> {
        let txn = self.db.begin_read().map_err(err)?;
        let table = txn.open_table(GRADES_TABLE).map_err(err)?;
        Ok(table.len().map_err(err)? as usize)
    }

    /// `true` if no document is stored.
    pub fn is_empty(&self) -> Result<bool, RedbError> {
        Ok(self.len()? == 0)
    }
}

impl GradeStore for RedbStore {
    fn backend(&self) -> &'static str {
        Self::BACKEND
    }

    fn get(&self, key: &Key) -> Result<Option<String>, StoreError> {
        Ok(self.document(key)?.map(|doc| doc.grade))
    }

    fn set(&mut self, key: &Key, value: &str) -> Result<(), StoreError> {
        let id = document_key(key);
        let txn = self.db.begin_write().map_err(err)?;
        {
            let mut table = txn.open_table(GRADES_TABLE).map_err(err)?;
            let existing = table
                .get(id.as_str())
                .map_err(err)?
                .map(|guard| guard.value().to_vec());

            let doc = match existing {
                Some(bytes) => {
                    let mut doc = GradeDocument::from_bytes(&bytes).map_err(err)?;
                    doc.grade = value.to_string();
                    doc
                }
                None => GradeDocument::new(key, value),
            };
            let bytes = doc.to_bytes().map_err(err)?;
            table.insert(id.as_str(), bytes.as_slice()).map_err(err)?;
        }
        txn.commit().map_err(err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> RedbStore {
        RedbStore::open_in_memory().unwrap()
    }

    #[test]
    fn set_get_overwrite() {
        let mut store = test_store();
        let key = Key::new("SID1033", "CSE016");

        assert_eq!(store.get(&key).unwrap(), None);
        store.set(&key, "A").unwrap();
        store.set(&key, "B").unwrap();

        assert_eq!(store.get(&key).unwrap().as_deref(), Some("B"));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn keys_do_not_collide_across_fields() {
        let mut store = test_store();
        store.set(&Key::new("s1", "c12"), "A").unwrap();
        store.set(&Key::new("s1c", "12"), "B").unwrap();

        assert_eq!(store.get(&Key::new("s1", "c12")).unwrap().as_deref(), Some("A"));
        assert_eq!(store.get(&Key::new("s1c", "12")).unwrap().as_deref(), Some("B"));
    }

    #[test]
    fn set_keeps_other_document_fields() {
        let mut store = test_store();
        let key = Key::new("s1", "c1");
        let mut doc = GradeDocument::new(&key, "C");
        doc.roll_no = "42".into();
        doc.email = "s1@uni.edu".into();
        store.put_document(&doc).unwrap();

        store.set(&key, "A").unwrap();

        let stored = store.document(&key).unwrap().unwrap();
        assert_eq!(stored.grade, "A");
        assert_eq!(stored.roll_no, "42");
        assert_eq!(stored.email, "s1@uni.edu");
    }

    #[test]
    fn reopen_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grades.redb");
        {
            let mut store = RedbStore::open(&path).unwrap();
            store.set(&Key::new("s1", "c1"), "A").unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.get(&Key::new("s1", "c1")).unwrap().as_deref(), Some("A"));
    }
}
