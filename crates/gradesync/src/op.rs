use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::error::ReplicaError;

/// Composite record identifier shared by every replica.
///
/// Serialized as a two-element array `["s1", "c1"]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct Key {
    /// Student identifier.
    pub student_id: String,
    /// Course identifier.
    pub course_id: String,
}

impl Key {
    /// Create a key without validating it.
    pub fn new(student_id: impl Into<String>, course_id: impl Into<String>) -> Self {
        Self {
            student_id: student_id.into(),
            course_id: course_id.into(),
        }
    }

    /// Parse the harness form `student,course`.
    pub fn parse(s: &str) -> Result<Self, ReplicaError> {
        let (student, course) = s
            .split_once(',')
            .ok_or_else(|| ReplicaError::Misuse(format!("key {s:?} is not `student,course`")))?;
        let key = Self::new(student.trim(), course.trim());
        key.validate()?;
        Ok(key)
    }

    /// Reject empty parts and control characters.
    ///
    /// Tabs and newlines would split a row of the batch-file backend.
    pub fn validate(&self) -> Result<(), ReplicaError> {
        check_field("student_id", &self.student_id)?;
        check_field("course_id", &self.course_id)
    }
}

pub(crate) fn check_field(field: &str, value: &str) -> Result<(), ReplicaError> {
    if value.is_empty() {
        return Err(ReplicaError::Misuse(format!("{field} must not be empty")));
    }
    if value.chars().any(char::is_control) {
        return Err(ReplicaError::Misuse(format!(
            "{field} {value:?} contains control characters"
        )));
    }
    Ok(())
}

impl From<(String, String)> for Key {
    fn from((student_id, course_id): (String, String)) -> Self {
        Self {
            student_id,
            course_id,
        }
    }
}

impl From<Key> for (String, String) {
    fn from(key: Key) -> Self {
        (key.student_id, key.course_id)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.student_id, self.course_id)
    }
}

/// Kind of a logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpKind {
    /// A read. Logged for audit only, never replayed.
    Get,
    /// A write. The unit of replication.
    Set,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => f.write_str("GET"),
            Self::Set => f.write_str("SET"),
        }
    }
}

/// Where a relayed write first came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    /// Replica that performed the original `set`.
    pub replica: String,
    /// When that replica performed it.
    pub timestamp: Timestamp,
}

/// One entry of an [`OperationLog`](crate::OperationLog).
///
/// `timestamp` is the time this replica executed or learned the operation.
/// Writes absorbed by a merge are stamped at merge time; `origin` keeps the
/// author and the author's time for inspection but is never compared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Local execution (or learning) time.
    pub timestamp: Timestamp,
    /// Read or write.
    #[serde(rename = "type")]
    pub kind: OpKind,
    /// Target record.
    pub key: Option<Key>,
    /// Written value; `None` for reads.
    pub value: Option<String>,
    /// Author of a relayed write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
}

impl Operation {
    /// A read of `key`.
    pub fn get(timestamp: Timestamp, key: Key) -> Self {
        Self {
            timestamp,
            kind: OpKind::Get,
            key: Some(key),
            value: None,
            origin: None,
        }
    }

    /// A write of `value` under `key`.
    pub fn set(timestamp: Timestamp, key: Key, value: impl Into<String>) -> Self {
        Self {
            timestamp,
            kind: OpKind::Set,
            key: Some(key),
            value: Some(value.into()),
            origin: None,
        }
    }

    /// Attach provenance to a relayed write.
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// `true` for writes.
    pub fn is_set(&self) -> bool {
        self.kind == OpKind::Set
    }

    /// Key and value of a well-formed write, `None` for reads and for
    /// writes missing either field.
    pub fn as_write(&self) -> Option<(&Key, &str)> {
        match (self.kind, &self.key, &self.value) {
            (OpKind::Set, Some(key), Some(value)) => Some((key, value)),
            _ => None,
        }
    }
}
