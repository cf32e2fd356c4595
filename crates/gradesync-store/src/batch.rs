//! Batch-file backend: a directory holding one tab-separated part file,
//! the layout a MapReduce-style job leaves behind.
//!
//! ```text
//! grades/
//!   part-m-00000    student_id \t course_id \t roll_no \t email \t grade
//! ```
//!
//! Reads scan the part file. Writes never edit it in place: the whole table
//! is written into a sibling `<dir>_temp` directory. `<dir>` is then moved
//! aside to `<dir>_old`, the temp directory takes its place, and the old
//! copy is deleted. Every step is a rename, so a crash leaves one complete
//! table on disk, and [`BatchFileStore::open`] puts it back under `<dir>`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use gradesync::{GradeStore, Key, StoreError};

use crate::document::GradeDocument;

/// Name of the single part file inside the data directory.
pub const PART_FILE: &str = "part-m-00000";

/// Filesystem failure in the batch-file backend.
#[derive(Debug)]
pub struct BatchError {
    path: PathBuf,
    source: io::Error,
}

impl BatchError {
    fn at(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Path the failing operation touched.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.source)
    }
}

impl std::error::Error for BatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<BatchError> for StoreError {
    fn from(e: BatchError) -> Self {
        StoreError::new(BatchFileStore::BACKEND, e)
    }
}

enum Line {
    Record(GradeDocument),
    Other(String),
}

impl Line {
    fn parse(raw: &str) -> Self {
        let fields: Vec<&str> = raw.split('\t').collect();
        match fields.as_slice() {
            [student_id, course_id, roll_no, email, grade] => Line::Record(GradeDocument {
                student_id: student_id.to_string(),
                course_id: course_id.to_string(),
                roll_no: roll_no.to_string(),
                email: email.to_string(),
                grade: grade.to_string(),
            }),
            _ => Line::Other(raw.to_string()),
        }
    }
}

fn render(doc: &GradeDocument) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}",
        doc.student_id, doc.course_id, doc.roll_no, doc.email, doc.grade
    )
}

/// Grades kept in a part file under a data directory.
#[derive(Debug, Clone)]
pub struct BatchFileStore {
    dir: PathBuf,
}

impl BatchFileStore {
    /// Backend name reported in logs and errors.
    pub const BACKEND: &'static str = "batch";

    /// Use `dir` as the data directory, creating it with an empty part file
    /// if it does not exist.
    ///
    /// A swap interrupted by a crash is finished first: if `<dir>` is gone,
    /// the complete `<dir>_temp` or the `<dir>_old` backup takes its place.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, BatchError> {
        let store = Self {
            dir: dir.as_ref().to_path_buf(),
        };
        store.recover()?;

        let part = store.part_file();
        if !part.exists() {
            fs::create_dir_all(&store.dir).map_err(BatchError::at(&store.dir))?;
            fs::write(&part, "").map_err(BatchError::at(&part))?;
            tracing::debug!("initialised empty batch store at {}", store.dir.display());
        }
        Ok(store)
    }

    fn recover(&self) -> Result<(), BatchError> {
        let backup = self.sibling("_old");
        if !self.part_file().exists() {
            // `<dir>` only disappears after `<dir>_temp` is fully written.
            for candidate in [self.sibling("_temp"), backup.clone()] {
                if candidate.join(PART_FILE).exists() {
                    if self.dir.exists() {
                        fs::remove_dir_all(&self.dir).map_err(BatchError::at(&self.dir))?;
                    }
                    fs::rename(&candidate, &self.dir).map_err(BatchError::at(&self.dir))?;
                    tracing::warn!(
                        "recovered batch store {} from {}",
                        self.dir.display(),
                        candidate.display()
                    );
                    break;
                }
            }
        }
        if backup.exists() {
            fs::remove_dir_all(&backup).map_err(BatchError::at(&backup))?;
        }
        Ok(())
    }

    /// The data directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn part_file(&self) -> PathBuf {
        self.dir.join(PART_FILE)
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.dir.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn read_lines(&self) -> Result<Vec<Line>, BatchError> {
        let part = self.part_file();
        let contents = match fs::read_to_string(&part) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BatchError::at(&part)(e)),
        };
        Ok(contents
            .lines()
            .filter(|l| !l.is_empty())
            .map(Line::parse)
            .collect())
    }

    /// Every well-formed record, in file order.
    pub fn documents(&self) -> Result<Vec<GradeDocument>, BatchError> {
        Ok(self
            .read_lines()?
            .into_iter()
            .filter_map(|line| match line {
                Line::Record(doc) => Some(doc),
                Line::Other(_) => None,
            })
            .collect())
    }

    fn replace(&self, lines: &[String]) -> Result<(), BatchError> {
        let temp = self.sibling("_temp");
        if temp.exists() {
            fs::remove_dir_all(&temp).map_err(BatchError::at(&temp))?;
        }
        fs::create_dir_all(&temp).map_err(BatchError::at(&temp))?;

        let mut contents = lines.join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }
        let temp_part = temp.join(PART_FILE);
        fs::write(&temp_part, contents).map_err(BatchError::at(&temp_part))?;

        let backup = self.sibling("_old");
        if backup.exists() {
            fs::remove_dir_all(&backup).map_err(BatchError::at(&backup))?;
        }
        if self.dir.exists() {
            fs::rename(&self.dir, &backup).map_err(BatchError::at(&backup))?;
        }
        if let Err(e) = fs::rename(&temp, &self.dir) {
            // Put the previous table back; the new one stays in `<dir>_temp`.
            if backup.exists() {
                let _ = fs::rename(&backup, &self.dir);
            }
            return Err(BatchError::at(&self.dir)(e));
        }
        if backup.exists() {
            fs::remove_dir_all(&backup).map_err(BatchError::at(&backup))?;
        }
        Ok(())
    }
}

impl GradeStore for BatchFileStore {
    fn backend(&self) -> &'static str {
        Self::BACKEND
    }

    fn get(&self, key: &Key) -> Result<Option<String>, StoreError> {
        for line in self.read_lines()? {
            match line {
                Line::Record(doc)
                    if doc.student_id == key.student_id && doc.course_id == key.course_id =>
                {
                    return Ok(Some(doc.grade));
                }
                _ => {}
            }
        }
        Ok(None)
    }

    fn set(&mut self, key: &Key, value: &str) -> Result<(), StoreError> {
        let mut found = false;
        let mut out = Vec::new();
        for line in self.read_lines()? {
            match line {
                Line::Record(mut doc)
                    if doc.student_id == key.student_id && doc.course_id == key.course_id =>
                {
                    if !found {
                        doc.grade = value.to_string();
                        out.push(render(&doc));
                        found = true;
                    }
                }
                Line::Record(doc) => out.push(render(&doc)),
                Line::Other(raw) => {
                    tracing::warn!(
                        "keeping malformed line in {}: {raw:?}",
                        self.part_file().display()
                    );
                    out.push(raw);
                }
            }
        }
        if !found {
            out.push(render(&GradeDocument::new(key, value)));
        }
        self.replace(&out)?;
        Ok(())
    }
}
