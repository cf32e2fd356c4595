//! Append-only operation log with per-peer merge bookmarks.
//!
//! Each replica owns one [`OperationLog`]. On disk it is two pretty-printed
//! JSON documents in the replica's data directory:
//!
//! | File | Contents |
//! |------|----------|
//! | `oplog_<name>.json` | array of [`Operation`] records, in append order |
//! | `merge_history_<name>.json` | object mapping peer name to last merge time (or `null`) |
//!
//! Both are rewritten in full after every mutation, through a temporary
//! file and a rename, so a reader never sees a half-written document.
//! Loading is forgiving: a missing, empty, or unparseable file yields empty
//! state, and malformed entries are skipped with a warning.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::clock::Timestamp;
use crate::error::PersistenceError;
use crate::op::{Key, Operation};

/// Last completed merge with each known peer.
///
/// `None` means "never merged": the peer's entire log is a candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MergeHistory {
    peers: BTreeMap<String, Option<Timestamp>>,
}

impl MergeHistory {
    /// History with a `None` entry for each peer.
    pub fn seeded<'a>(peers: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            peers: peers
                .into_iter()
                .map(|p| (p.to_lowercase(), None))
                .collect(),
        }
    }

    /// Last merge time with `peer`, if any.
    pub fn last_merge(&self, peer: &str) -> Option<Timestamp> {
        self.peers.get(&peer.to_lowercase()).copied().flatten()
    }

    /// Iterate over `(peer, last merge)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<Timestamp>)> {
        self.peers.iter().map(|(p, t)| (p.as_str(), *t))
    }

    fn entry(&self, peer: &str) -> Option<Option<Timestamp>> {
        self.peers.get(&peer.to_lowercase()).copied()
    }

    fn set(&mut self, peer: &str, time: Timestamp) -> Option<Option<Timestamp>> {
        self.peers.insert(peer.to_lowercase(), Some(time))
    }

    fn restore(&mut self, peer: &str, previous: Option<Option<Timestamp>>) {
        match previous {
            Some(prev) => {
                self.peers.insert(peer.to_lowercase(), prev);
            }
            None => {
                self.peers.remove(&peer.to_lowercase());
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Persistence {
    Memory,
    Files { log: PathBuf, history: PathBuf },
}

/// Path of the operation log file for `replica` under `dir`.
pub fn log_path(dir: &Path, replica: &str) -> PathBuf {
    dir.join(format!("oplog_{}.json", replica.to_lowercase()))
}

/// Path of the merge history file for `replica` under `dir`.
pub fn history_path(dir: &Path, replica: &str) -> PathBuf {
    dir.join(format!("merge_history_{}.json", replica.to_lowercase()))
}

/// An append-only sequence of operations plus merge bookmarks, owned by one
/// replica.
///
/// # Example
///
/// ```
/// use gradesync::clock::{Clock, WallClock};
/// use gradesync::{Key, Operation, OperationLog};
///
/// let clock = WallClock::new();
/// let mut log = OperationLog::in_memory("pig");
/// log.append(Operation::set(clock.now(), Key::new("s1", "c1"), "A")).unwrap();
///
/// assert_eq!(log.operations_since("mongodb").len(), 1);
/// log.record_merge("mongodb", clock.now()).unwrap();
/// assert!(log.operations_since("mongodb").is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct OperationLog {
    replica: String,
    operations: Vec<Operation>,
    history: MergeHistory,
    persistence: Persistence,
}

impl OperationLog {
    /// A log that lives only in memory.
    pub fn in_memory(replica: &str) -> Self {
        Self {
            replica: replica.to_lowercase(),
            operations: Vec::new(),
            history: MergeHistory::default(),
            persistence: Persistence::Memory,
        }
    }

    /// Load the log for `replica` from `dir`.
    ///
    /// Never fails: unreadable state is logged and replaced with empty
    /// state. When no history file exists, the history is seeded with a
    /// `None` entry for each of `known_peers`.
    pub fn open<'a>(
        dir: &Path,
        replica: &str,
        known_peers: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let log = log_path(dir, replica);
        let history = history_path(dir, replica);

        let operations = load_operations(&log);
        let history_state = load_history(&history).unwrap_or_else(|| {
            let own = replica.to_lowercase();
            MergeHistory::seeded(
                known_peers
                    .into_iter()
                    .filter(|p| !p.eq_ignore_ascii_case(&own)),
            )
        });

        tracing::debug!(
            replica,
            operations = operations.len(),
            "loaded operation log from {}",
            dir.display()
        );

        Self {
            replica: replica.to_lowercase(),
            operations,
            history: history_state,
            persistence: Persistence::Files { log, history },
        }
    }

    /// Name of the owning replica (lower-cased).
    pub fn replica(&self) -> &str {
        &self.replica
    }

    /// All operations in append order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Number of logged operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// `true` if nothing has been logged.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Per-peer merge bookmarks.
    pub fn merge_history(&self) -> &MergeHistory {
        &self.history
    }

    /// Last merge time with `peer`, if any.
    pub fn last_merge(&self, peer: &str) -> Option<Timestamp> {
        self.history.last_merge(peer)
    }

    /// Durably append `op`.
    ///
    /// If the log cannot be saved the operation is not kept in memory
    /// either, and the error is returned.
    pub fn append(&mut self, op: Operation) -> Result<(), PersistenceError> {
        self.operations.push(op);
        if let Err(e) = self.save_log() {
            self.operations.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Operations recorded after the last merge with `peer`, in stored
    /// order. The whole log if the two never merged.
    pub fn operations_since(&self, peer: &str) -> Vec<Operation> {
        match self.history.last_merge(peer) {
            None => self.operations.clone(),
            Some(last) => self
                .operations
                .iter()
                .filter(|op| op.timestamp > last)
                .cloned()
                .collect(),
        }
    }

    /// Overwrite the merge bookmark for `peer`.
    pub fn record_merge(&mut self, peer: &str, time: Timestamp) -> Result<(), PersistenceError> {
        let previous = self.history.set(peer, time);
        if let Err(e) = self.save_history() {
            self.history.restore(peer, previous);
            return Err(e);
        }
        Ok(())
    }

    /// The raw bookmark entry for `peer`: `None` if the peer is not listed
    /// at all, `Some(None)` if it is listed but never merged.
    pub(crate) fn bookmark(&self, peer: &str) -> Option<Option<Timestamp>> {
        self.history.entry(peer)
    }

    /// Put back a bookmark taken with [`bookmark`](Self::bookmark) and save.
    pub(crate) fn unrecord_merge(
        &mut self,
        peer: &str,
        previous: Option<Option<Timestamp>>,
    ) -> Result<(), PersistenceError> {
        self.history.restore(peer, previous);
        self.save_history()
    }

    /// Timestamp of the latest own `SET` for each key.
    pub fn latest_sets(&self) -> HashMap<Key, Timestamp> {
        let mut latest: HashMap<Key, Timestamp> = HashMap::new();
        for op in &self.operations {
            if let Some((key, _)) = op.as_write() {
                latest
                    .entry(key.clone())
                    .and_modify(|ts| *ts = (*ts).max(op.timestamp))
                    .or_insert(op.timestamp);
            }
        }
        latest
    }

    fn save_log(&self) -> Result<(), PersistenceError> {
        match &self.persistence {
            Persistence::Memory => Ok(()),
            Persistence::Files { log, .. } => write_json(log, &self.operations),
        }
    }

    fn save_history(&self) -> Result<(), PersistenceError> {
        match &self.persistence {
            Persistence::Memory => Ok(()),
            Persistence::Files { history, .. } => write_json(history, &self.history),
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(io_err(path))
}

/// Read a JSON document; `None` when absent, empty, or unreadable.
fn read_json(path: &Path) -> Option<serde_json::Value> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!("cannot read {}: {e}; starting empty", path.display());
            return None;
        }
    };
    if contents.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("corrupt {}: {e}; starting empty", path.display());
            None
        }
    }
}

fn load_operations(path: &Path) -> Vec<Operation> {
    let entries = match read_json(path) {
        Some(serde_json::Value::Array(entries)) => entries,
        Some(_) => {
            tracing::warn!("{} is not a JSON array; starting empty", path.display());
            return Vec::new();
        }
        None => return Vec::new(),
    };

    let mut operations = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value::<Operation>(entry) {
            Ok(op) => operations.push(op),
            Err(e) => tracing::warn!("skipping entry {index} of {}: {e}", path.display()),
        }
    }
    operations
}

fn load_history(path: &Path) -> Option<MergeHistory> {
    let entries = match read_json(path)? {
        serde_json::Value::Object(entries) => entries,
        _ => {
            tracing::warn!("{} is not a JSON object; starting empty", path.display());
            return None;
        }
    };

    let mut peers = BTreeMap::new();
    for (peer, value) in entries {
        let last = match value {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => match s.parse::<Timestamp>() {
                Ok(ts) => Some(ts),
                Err(e) => {
                    tracing::warn!("ignoring merge time for {peer} in {}: {e}", path.display());
                    None
                }
            },
            other => {
                tracing::warn!(
                    "ignoring merge time for {peer} in {}: unexpected {other}",
                    path.display()
                );
                None
            }
        };
        peers.insert(peer.to_lowercase(), last);
    }
    Some(MergeHistory { peers })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_PEERS: [&str; 0] = [];

    fn ts(n: i64) -> Timestamp {
        Timestamp::from_micros(1_714_555_800_000_000 + n)
    }

    fn set(n: i64, student: &str, value: &str) -> Operation {
        Operation::set(ts(n), Key::new(student, "c1"), value)
    }

    #[test]
    fn operations_since_without_history_is_everything() {
        let mut log = OperationLog::in_memory("pig");
        log.append(set(1, "s1", "A")).unwrap();
        log.append(Operation::get(ts(2), Key::new("s1", "c1"))).unwrap();

        assert_eq!(log.operations_since("mongodb").len(), 2);
    }

    #[test]
    fn operations_since_filters_strictly_after_merge() {
        let mut log = OperationLog::in_memory("pig");
        log.append(set(1, "s1", "A")).unwrap();
        log.append(set(2, "s2", "B")).unwrap();
        log.append(set(3, "s3", "C")).unwrap();
        log.record_merge("mongodb", ts(2)).unwrap();

        let since = log.operations_since("mongodb");
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].value.as_deref(), Some("C"));

        // other peers are unaffected
        assert_eq!(log.operations_since("postgresql").len(), 3);
    }

    #[test]
    fn operations_since_keeps_stored_order() {
        let mut log = OperationLog::in_memory("pig");
        log.append(set(9, "s1", "late")).unwrap();
        log.append(set(4, "s2", "early")).unwrap();

        let values: Vec<_> = log
            .operations_since("mongodb")
            .into_iter()
            .map(|op| op.value.unwrap())
            .collect();
        assert_eq!(values, vec!["late", "early"]);
    }

    #[test]
    fn record_merge_overwrites_and_is_case_insensitive() {
        let mut log = OperationLog::in_memory("pig");
        log.record_merge("MongoDB", ts(1)).unwrap();
        log.record_merge("mongodb", ts(5)).unwrap();
        log.record_merge("mongodb", ts(5)).unwrap();

        assert_eq!(log.last_merge("MONGODB"), Some(ts(5)));
        assert_eq!(log.merge_history().iter().count(), 1);
    }

    #[test]
    fn latest_sets_ignores_reads() {
        let mut log = OperationLog::in_memory("pig");
        log.append(set(1, "s1", "A")).unwrap();
        log.append(set(3, "s1", "B")).unwrap();
        log.append(Operation::get(ts(7), Key::new("s1", "c1"))).unwrap();
        log.append(set(2, "s2", "C")).unwrap();

        let latest = log.latest_sets();
        assert_eq!(latest[&Key::new("s1", "c1")], ts(3));
        assert_eq!(latest[&Key::new("s2", "c1")], ts(2));
        assert_eq!(latest.len(), 2);
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = OperationLog::open(dir.path(), "PIG", ["postgresql", "mongodb", "pig"]);
            log.append(set(1, "s1", "A")).unwrap();
            log.record_merge("mongodb", ts(2)).unwrap();
        }

        assert!(dir.path().join("oplog_pig.json").exists());
        assert!(dir.path().join("merge_history_pig.json").exists());

        let log = OperationLog::open(dir.path(), "pig", ["postgresql", "mongodb", "pig"]);
        assert_eq!(log.len(), 1);
        assert_eq!(log.operations()[0].value.as_deref(), Some("A"));
        assert_eq!(log.last_merge("mongodb"), Some(ts(2)));
        assert_eq!(log.last_merge("postgresql"), None);
    }

    #[test]
    fn fresh_history_lists_known_peers() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = OperationLog::open(dir.path(), "pig", ["postgresql", "mongodb", "pig"]);
        log.record_merge("mongodb", ts(1)).unwrap();

        let raw = fs::read_to_string(history_path(dir.path(), "pig")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "mongodb": "2024-05-01T09:30:00.000001",
                "postgresql": null,
            })
        );
    }

    #[test]
    fn missing_empty_and_corrupt_files_load_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = OperationLog::open(dir.path(), "a", NO_PEERS);
        assert!(log.is_empty());

        fs::write(log_path(dir.path(), "b"), "").unwrap();
        assert!(OperationLog::open(dir.path(), "b", NO_PEERS).is_empty());

        fs::write(log_path(dir.path(), "c"), "[{ not json").unwrap();
        fs::write(history_path(dir.path(), "c"), "{{{").unwrap();
        let log = OperationLog::open(dir.path(), "c", ["a"]);
        assert!(log.is_empty());
        assert_eq!(log.last_merge("a"), None);
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            log_path(dir.path(), "pig"),
            r#"[
                {"timestamp": "2024-05-01T09:30:00.000001", "type": "SET", "key": ["s1","c1"], "value": "A"},
                {"timestamp": "not a time", "type": "SET", "key": ["s1","c1"], "value": "X"},
                {"timestamp": "2024-05-01T09:30:00.000002", "type": "DELETE", "key": ["s1","c1"]},
                42,
                {"timestamp": "2024-05-01T09:30:00.000003", "type": "GET", "key": ["s1","c1"], "value": null}
            ]"#,
        )
        .unwrap();
        fs::write(
            history_path(dir.path(), "pig"),
            r#"{"mongodb": "garbage", "postgresql": "2024-05-01T09:30:00.000002", "extra": 7}"#,
        )
        .unwrap();

        let log = OperationLog::open(dir.path(), "pig", NO_PEERS);
        assert_eq!(log.len(), 2);
        assert_eq!(log.last_merge("mongodb"), None);
        assert_eq!(log.last_merge("postgresql"), Some(ts(2)));
    }

    #[test]
    fn failed_save_surfaces_error_and_keeps_memory_consistent() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the log file should be makes the rename fail.
        fs::create_dir(log_path(dir.path(), "pig")).unwrap();
        fs::create_dir(history_path(dir.path(), "pig")).unwrap();

        let mut log = OperationLog::open(dir.path(), "pig", NO_PEERS);
        assert!(log.append(set(1, "s1", "A")).is_err());
        assert!(log.is_empty());

        assert!(log.record_merge("mongodb", ts(1)).is_err());
        assert_eq!(log.last_merge("mongodb"), None);
    }
}
