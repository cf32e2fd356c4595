//! Pairwise pull-and-apply reconciliation with last-writer-wins per key.
//!
//! `target.merge_from(peer)`:
//!
//! 1. takes the peer's operations recorded since the last merge of the pair;
//! 2. drops reads;
//! 3. keeps a write only if the target has no `SET` for that key, or the
//!    write is strictly newer than the target's latest own `SET` (snapshotted
//!    once, before anything is applied);
//! 4. applies the survivors oldest first through the normal `set` path, so
//!    each one is re-logged on the target stamped with the merge time;
//! 5. records one shared merge time on both sides.
//!
//! The merge time is taken after the last write is applied, so writes the
//! target just absorbed are not offered back to the peer on the reverse
//! merge. If anything fails, including the peer's bookmark save in step 5,
//! neither bookmark moves and a retry sees the same candidates.

use std::fmt;

use crate::clock::Timestamp;
use crate::error::ReplicaError;
use crate::op::{check_field, Key, Origin};
use crate::replica::Replica;

/// Outcome of one merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    /// Peer the operations were pulled from.
    pub peer: String,
    /// Bookmark recorded on both sides.
    pub merge_time: Timestamp,
    /// Peer operations newer than the previous bookmark.
    pub candidates: usize,
    /// Writes applied to the target.
    pub applied: usize,
    /// Writes dropped because the target had a newer or equal own write.
    pub conflicts_skipped: usize,
    /// Reads among the candidates (never replayed).
    pub reads_ignored: usize,
    /// Writes with a missing or invalid key or value.
    pub malformed_skipped: usize,
}

impl fmt::Display for MergeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "merged {}: {} candidates, {} applied, {} conflicts skipped, {} reads ignored",
            self.peer, self.candidates, self.applied, self.conflicts_skipped, self.reads_ignored
        )?;
        if self.malformed_skipped > 0 {
            write!(f, ", {} malformed", self.malformed_skipped)?;
        }
        Ok(())
    }
}

struct Survivor {
    key: Key,
    value: String,
    origin: Origin,
}

impl Replica {
    /// Pull unseen writes from `peer` and apply those that win
    /// last-writer-wins against this replica's own writes.
    ///
    /// Both replicas' merge bookmarks are updated to the same time once
    /// every surviving write has been applied.
    pub fn merge_from(&mut self, peer: &mut Replica) -> Result<MergeReport, ReplicaError> {
        if self.name() == peer.name() {
            return Err(ReplicaError::Misuse(format!(
                "replica {} cannot merge with itself",
                self.name()
            )));
        }

        let candidates = peer.log().operations_since(self.name());
        let own_latest = self.log().latest_sets();

        let mut report = MergeReport {
            peer: peer.name().to_string(),
            merge_time: Timestamp::from_micros(0),
            candidates: candidates.len(),
            applied: 0,
            conflicts_skipped: 0,
            reads_ignored: 0,
            malformed_skipped: 0,
        };

        let mut survivors: Vec<(Timestamp, Survivor)> = Vec::new();
        for op in candidates {
            if !op.is_set() {
                report.reads_ignored += 1;
                continue;
            }
            let Some((key, value)) = op.as_write() else {
                tracing::warn!(peer = peer.name(), "skipping SET without key or value");
                report.malformed_skipped += 1;
                continue;
            };
            if let Err(e) = key.validate().and_then(|()| check_field("value", value)) {
                tracing::warn!(peer = peer.name(), "skipping SET {key}: {e}");
                report.malformed_skipped += 1;
                continue;
            }
            if let Some(own) = own_latest.get(key) {
                if op.timestamp <= *own {
                    tracing::debug!(
                        replica = self.name(),
                        peer = peer.name(),
                        "conflict on {key}: keeping own write at {own}, dropping {value:?} at {}",
                        op.timestamp
                    );
                    report.conflicts_skipped += 1;
                    continue;
                }
            }
            let origin = op.origin.clone().unwrap_or_else(|| Origin {
                replica: peer.name().to_string(),
                timestamp: op.timestamp,
            });
            survivors.push((
                op.timestamp,
                Survivor {
                    key: key.clone(),
                    value: value.to_string(),
                    origin,
                },
            ));
        }

        // Stable: equal timestamps keep log order.
        survivors.sort_by_key(|(ts, _)| *ts);

        for (_, write) in survivors {
            self.apply(&write.key, &write.value, Some(write.origin))?;
            report.applied += 1;
        }

        let merge_time = self.now();
        let peer_name = peer.name().to_string();
        let own_name = self.name().to_string();
        let previous = self.log().bookmark(&peer_name);
        self.log_mut().record_merge(&peer_name, merge_time)?;
        if let Err(e) = peer.log_mut().record_merge(&own_name, merge_time) {
            if let Err(undo) = self.log_mut().unrecord_merge(&peer_name, previous) {
                tracing::error!(
                    replica = %own_name,
                    "bookmark for {peer_name} could not be rolled back: {undo}"
                );
            }
            return Err(e.into());
        }
        report.merge_time = merge_time;

        tracing::info!(replica = %own_name, "{report}");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::WallClock;
    use crate::op::Operation;
    use crate::oplog::{history_path, OperationLog};
    use crate::store::{GradeStore, MemoryStore, StoreError};

    fn ts(n: i64) -> Timestamp {
        Timestamp::from_micros(1_714_555_800_000_000 + n)
    }

    /// Clock that starts after every hand-made timestamp in these tests.
    fn clock() -> Arc<WallClock> {
        Arc::new(WallClock::new())
    }

    /// Replica whose log is pre-filled with `ops` (store untouched).
    fn seeded(name: &str, ops: Vec<Operation>, clock: Arc<WallClock>) -> Replica {
        let mut log = OperationLog::in_memory(name);
        for op in ops {
            log.append(op).unwrap();
        }
        Replica::new(name, log, Box::new(MemoryStore::new()), clock)
    }

    fn k(student: &str) -> Key {
        Key::new(student, "c1")
    }

    #[test]
    fn applies_unseen_writes_and_records_both_sides() {
        let clock = clock();
        let mut target = Replica::in_memory("pig", clock.clone());
        let mut peer = Replica::in_memory("mongodb", clock);
        peer.set(&k("s1"), "A").unwrap();
        peer.get(&k("s1")).unwrap();

        let report = target.merge_from(&mut peer).unwrap();

        assert_eq!(report.candidates, 2);
        assert_eq!(report.applied, 1);
        assert_eq!(report.reads_ignored, 1);
        assert_eq!(target.get(&k("s1")).unwrap().as_deref(), Some("A"));
        assert_eq!(target.log().last_merge("mongodb"), Some(report.merge_time));
        assert_eq!(peer.log().last_merge("pig"), Some(report.merge_time));
    }

    #[test]
    fn older_candidate_does_not_overwrite_newer_own_write() {
        let clock = clock();
        let mut peer = seeded("mongodb", vec![Operation::set(ts(1), k("s1"), "old")], clock.clone());
        let mut target = Replica::in_memory("pig", clock);
        target.set(&k("s1"), "new").unwrap();

        let report = target.merge_from(&mut peer).unwrap();

        assert_eq!(report.conflicts_skipped, 1);
        assert_eq!(report.applied, 0);
        assert_eq!(target.get(&k("s1")).unwrap().as_deref(), Some("new"));
    }

    #[test]
    fn equal_timestamp_is_not_newer() {
        let clock = clock();
        let mut target = seeded("pig", vec![Operation::set(ts(5), k("s1"), "mine")], clock.clone());
        let mut peer = seeded("mongodb", vec![Operation::set(ts(5), k("s1"), "theirs")], clock);

        let report = target.merge_from(&mut peer).unwrap();
        assert_eq!(report.conflicts_skipped, 1);
        assert_eq!(report.applied, 0);
    }

    #[test]
    fn survivors_applied_in_timestamp_order() {
        let clock = clock();
        let mut peer = seeded(
            "mongodb",
            vec![
                Operation::set(ts(9), k("s1"), "third"),
                Operation::set(ts(3), k("s1"), "first"),
                Operation::set(ts(6), k("s1"), "second"),
            ],
            clock.clone(),
        );
        let mut target = Replica::in_memory("pig", clock);

        let report = target.merge_from(&mut peer).unwrap();
        assert_eq!(report.applied, 3);
        assert_eq!(target.get(&k("s1")).unwrap().as_deref(), Some("third"));

        let relayed: Vec<_> = target
            .log()
            .operations()
            .iter()
            .filter_map(|op| op.origin.as_ref().map(|o| o.timestamp))
            .collect();
        assert_eq!(relayed, vec![ts(3), ts(6), ts(9)]);
    }

    #[test]
    fn own_latest_is_snapshotted_before_applying() {
        // Both peer writes beat the target's own write. Had the check been
        // recomputed after the first apply, the freshly logged self-write
        // would shadow the second candidate.
        let clock = clock();
        let mut target = seeded("pig", vec![Operation::set(ts(1), k("s1"), "own")], clock.clone());
        let mut peer = seeded(
            "mongodb",
            vec![
                Operation::set(ts(2), k("s1"), "B"),
                Operation::set(ts(3), k("s1"), "C"),
            ],
            clock,
        );

        let report = target.merge_from(&mut peer).unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(target.get(&k("s1")).unwrap().as_deref(), Some("C"));
    }

    #[test]
    fn conflicts_are_per_key() {
        let clock = clock();
        let mut peer = seeded(
            "mongodb",
            vec![
                Operation::set(ts(1), k("s1"), "loses"),
                Operation::set(ts(2), k("s2"), "wins"),
            ],
            clock.clone(),
        );
        let mut target = Replica::in_memory("pig", clock);
        target.set(&k("s1"), "kept").unwrap();

        let report = target.merge_from(&mut peer).unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.conflicts_skipped, 1);
        assert_eq!(target.get(&k("s1")).unwrap().as_deref(), Some("kept"));
        assert_eq!(target.get(&k("s2")).unwrap().as_deref(), Some("wins"));
    }

    #[test]
    fn relayed_write_is_restamped_and_keeps_origin() {
        let clock = clock();
        let mut peer = Replica::in_memory("mongodb", clock.clone());
        let mut target = Replica::in_memory("pig", clock.clone());
        peer.set(&k("s1"), "B").unwrap();
        let authored = peer.log().operations()[0].timestamp;

        target.merge_from(&mut peer).unwrap();

        let relayed = &target.log().operations()[0];
        assert!(relayed.timestamp > authored);
        assert_eq!(
            relayed.origin,
            Some(Origin {
                replica: "mongodb".into(),
                timestamp: authored,
            })
        );

        // A third replica sees the original author, not the relay.
        let mut third = Replica::in_memory("postgresql", clock);
        third.merge_from(&mut target).unwrap();
        let origin = third.log().operations()[0].origin.clone().unwrap();
        assert_eq!(origin.replica, "mongodb");
        assert_eq!(origin.timestamp, authored);
    }

    #[test]
    fn malformed_candidates_are_skipped() {
        let clock = clock();
        let mut broken = Operation::set(ts(1), k("s1"), "A");
        broken.key = None;
        let bad_key = Operation::set(ts(2), Key::new("s\t1", "c1"), "A");
        let mut peer = seeded(
            "mongodb",
            vec![broken, bad_key, Operation::set(ts(3), k("s2"), "ok")],
            clock.clone(),
        );
        let mut target = Replica::in_memory("pig", clock);

        let report = target.merge_from(&mut peer).unwrap();
        assert_eq!(report.malformed_skipped, 2);
        assert_eq!(report.applied, 1);
    }

    #[test]
    fn self_merge_is_rejected() {
        let clock = clock();
        let mut a = Replica::in_memory("pig", clock.clone());
        let mut b = Replica::in_memory("PIG", clock);
        assert!(matches!(a.merge_from(&mut b), Err(ReplicaError::Misuse(_))));
        assert!(a.log().merge_history().iter().next().is_none());
    }

    /// Store that refuses one specific value.
    struct RefusingStore {
        inner: MemoryStore,
        refuse: &'static str,
    }

    impl GradeStore for RefusingStore {
        fn backend(&self) -> &'static str {
            "refusing"
        }

        fn get(&self, key: &Key) -> Result<Option<String>, StoreError> {
            self.inner.get(key)
        }

        fn set(&mut self, key: &Key, value: &str) -> Result<(), StoreError> {
            if value == self.refuse {
                return Err(StoreError::new("refusing", "write rejected"));
            }
            self.inner.set(key, value)
        }
    }

    #[test]
    fn failure_mid_merge_leaves_bookmarks_untouched() {
        let clock = clock();
        let mut peer = seeded(
            "mongodb",
            vec![
                Operation::set(ts(1), k("s1"), "A"),
                Operation::set(ts(2), k("s2"), "poison"),
                Operation::set(ts(3), k("s3"), "C"),
            ],
            clock.clone(),
        );
        let mut target = Replica::new(
            "pig",
            OperationLog::in_memory("pig"),
            Box::new(RefusingStore {
                inner: MemoryStore::new(),
                refuse: "poison",
            }),
            clock,
        );

        let err = target.merge_from(&mut peer).unwrap_err();
        assert!(matches!(err, ReplicaError::Storage(_)));
        assert_eq!(target.log().last_merge("mongodb"), None);
        assert_eq!(peer.log().last_merge("pig"), None);

        // A retry re-evaluates the same candidate set.
        assert_eq!(peer.log().operations_since("pig").len(), 3);
    }

    #[test]
    fn failed_peer_bookmark_rolls_back_target_bookmark() {
        let dir = tempfile::tempdir().unwrap();
        let clock = clock();
        let open = |name: &str, peer: &str| {
            let log = OperationLog::open(dir.path(), name, [name, peer]);
            Replica::new(name, log, Box::new(MemoryStore::new()), clock.clone())
        };

        let mut target = open("pig", "mongodb");
        let mut peer = open("mongodb", "pig");
        peer.set(&k("s1"), "A").unwrap();

        // A directory where the peer's history file belongs fails its save.
        std::fs::create_dir(history_path(dir.path(), "mongodb")).unwrap();

        let err = target.merge_from(&mut peer).unwrap_err();
        assert!(matches!(err, ReplicaError::Persistence(_)));
        assert_eq!(target.log().last_merge("mongodb"), None);
        assert_eq!(peer.log().last_merge("pig"), None);

        // The rollback reached the disk too.
        let reopened = OperationLog::open(dir.path(), "pig", ["mongodb"]);
        assert_eq!(reopened.last_merge("mongodb"), None);
    }
}
