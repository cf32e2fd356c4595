//! Relational backend using rusqlite.
//!
//! Grades live in one `grades` table keyed by `(student_id, course_id)`.
//! `roll_no` and `email` are carried along for rows loaded from elsewhere
//! and are left untouched by `set`.
//!
//! # Example
//!
//! ```no_run
//! use gradesync::{GradeStore, Key};
//! use gradesync_store::SqliteStore;
//!
//! let mut store = SqliteStore::open("state/postgresql.db").unwrap();
//! store.set(&Key::new("SID1033", "CSE016"), "A").unwrap();
//! ```

use std::path::Path;
use std::sync::Mutex;

use gradesync::{GradeStore, Key, StoreError};
use rusqlite::{params, Connection, OptionalExtension};

use crate::document::GradeDocument;

/// Error type for the SQLite backend.
#[derive(Debug)]
pub enum SqliteError {
    /// An error from rusqlite.
    Sqlite(rusqlite::Error),
    /// Lock poisoned.
    LockPoisoned,
}

impl std::fmt::Display for SqliteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "sqlite error: {e}"),
            Self::LockPoisoned => write!(f, "sqlite lock poisoned"),
        }
    }
}

impl std::error::Error for SqliteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(e) => Some(e),
            Self::LockPoisoned => None,
        }
    }
}

impl From<rusqlite::Error> for SqliteError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<SqliteError> for StoreError {
    fn from(e: SqliteError) -> Self {
        StoreError::new(SqliteStore::BACKEND, e)
    }
}

/// Grades table in a SQLite database.
///
/// Wraps a `rusqlite::Connection` behind a `Mutex`. Creates the schema on
/// first open.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Backend name reported in logs and errors.
    pub const BACKEND: &'static str = "sqlite";

    /// Open (or create) a database file at `path`, in WAL mode with a
    /// five-second busy timeout.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SqliteError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database.
    pub fn open_in_memory() -> Result<Self, SqliteError> {
        let conn = Connection::open_in_memory()?;
        Self::create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn create_schema(conn: &Connection) -> Result<(), SqliteError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS grades (
                student_id  TEXT NOT NULL,
                course_id   TEXT NOT NULL,
                roll_no     TEXT NOT NULL DEFAULT '',
                email       TEXT NOT NULL DEFAULT '',
                grade       TEXT NOT NULL,
                PRIMARY KEY (student_id, course_id)
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, SqliteError> {
        self.conn.lock().map_err(|_| SqliteError::LockPoisoned)
    }

    /// Full row for `key`, including roll number and email.
    pub fn document(&self, key: &Key) -> Result<Option<GradeDocument>, SqliteError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT roll_no, email, grade FROM grades
                 WHERE student_id = ?1 AND course_id = ?2",
                params![key.student_id, key.course_id],
                |row| {
                    Ok(GradeDocument {
                        student_id: key.student_id.clone(),
                        course_id: key.course_id.clone(),
                        roll_no: row.get(0)?,
                        email: row.get(1)?,
                        grade: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Number of rows in the grades table.
    pub fn len(&self) -> Result<usize, SqliteError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM grades", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// `true` if the grades table is empty.
    pub fn is_empty(&self) -> Result<bool, SqliteError> {
        Ok(self.len()? == 0)
    }
}

impl GradeStore for SqliteStore {
    fn backend(&self) -> &'static str {
        Self::BACKEND
    }

    fn get(&self, key: &Key) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let grade = conn
            .query_row(
                "SELECT grade FROM grades WHERE student_id = ?1 AND course_id = ?2",
                params![key.student_id, key.course_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(SqliteError::from)?;
        Ok(grade)
    }

    fn set(&mut self, key: &Key, value: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO grades (student_id, course_id, grade)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(student_id, course_id)
             DO UPDATE SET grade = excluded.grade",
            params![key.student_id, key.course_id, value],
        )
        .map_err(SqliteError::from)?;
        Ok(())
    }
}
