use gradesync::Key;
use serde::{Deserialize, Serialize};

/// One grade record as the backends store it.
///
/// Only `grade` is read or written by a replica. `roll_no` and `email`
/// belong to rows loaded from elsewhere and are preserved across updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeDocument {
    /// Student identifier.
    pub student_id: String,
    /// Course identifier.
    pub course_id: String,
    /// Roll number, empty when unknown.
    pub roll_no: String,
    /// Contact email, empty when unknown.
    pub email: String,
    /// The replicated value.
    pub grade: String,
}

impl GradeDocument {
    /// A fresh record with no roll number or email.
    pub fn new(key: &Key, grade: &str) -> Self {
        Self {
            student_id: key.student_id.clone(),
            course_id: key.course_id.clone(),
            roll_no: String::new(),
            email: String::new(),
            grade: grade.to_string(),
        }
    }

    /// The record's key.
    pub fn key(&self) -> Key {
        Key::new(self.student_id.clone(), self.course_id.clone())
    }

    /// Compact binary encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decode bytes produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_preserves_every_field() {
        let mut doc = GradeDocument::new(&Key::new("SID1033", "CSE016"), "A");
        doc.roll_no = "42".into();
        doc.email = "sid1033@uni.edu".into();

        let decoded = GradeDocument::from_bytes(&doc.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, doc);
        assert_eq!(decoded.key(), Key::new("SID1033", "CSE016"));
    }

    #[test]
    fn truncated_bytes_fail() {
        let bytes = GradeDocument::new(&Key::new("s1", "c1"), "A").to_bytes().unwrap();
        assert!(GradeDocument::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
