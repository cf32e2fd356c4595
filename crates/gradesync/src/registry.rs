use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::ReplicaError;
use crate::merge::MergeReport;
use crate::op::Key;
use crate::replica::Replica;

/// The replicas of one process, addressed by name.
///
/// Each replica sits behind its own mutex, so `get`, `set`, and `merge`
/// against the same replica never interleave. A merge locks both replicas
/// in name order, which keeps `a.merge(b)` racing `b.merge(a)` free of
/// deadlock.
///
/// ```
/// use std::sync::Arc;
/// use gradesync::clock::WallClock;
/// use gradesync::{Key, Replica, ReplicaSet};
///
/// let clock = Arc::new(WallClock::new());
/// let mut set = ReplicaSet::new();
/// set.insert(Replica::in_memory("postgresql", clock.clone())).unwrap();
/// set.insert(Replica::in_memory("mongodb", clock)).unwrap();
///
/// let key = Key::new("s1", "c1");
/// set.set("POSTGRESQL", &key, "A").unwrap();
/// set.merge("mongodb", "postgresql").unwrap();
/// assert_eq!(set.get("mongodb", &key).unwrap().as_deref(), Some("A"));
/// ```
#[derive(Debug, Default)]
pub struct ReplicaSet {
    replicas: BTreeMap<String, Mutex<Replica>>,
}

// A panic mid-operation leaves nothing half-applied in memory that is not
// also on disk, so a poisoned replica is still usable.
fn lock(slot: &Mutex<Replica>) -> MutexGuard<'_, Replica> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ReplicaSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a replica. Names must be unique.
    pub fn insert(&mut self, replica: Replica) -> Result<(), ReplicaError> {
        let name = replica.name().to_string();
        if self.replicas.contains_key(&name) {
            return Err(ReplicaError::Misuse(format!(
                "replica {name} is registered twice"
            )));
        }
        self.replicas.insert(name, Mutex::new(replica));
        Ok(())
    }

    /// Registered names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.replicas.keys().map(String::as_str)
    }

    /// Number of registered replicas.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    /// `true` when no replica is registered.
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    fn slot(&self, name: &str) -> Result<&Mutex<Replica>, ReplicaError> {
        self.replicas
            .get(&name.to_lowercase())
            .ok_or_else(|| ReplicaError::Misuse(format!("unknown replica {name:?}")))
    }

    /// `GET` against one replica.
    pub fn get(&self, name: &str, key: &Key) -> Result<Option<String>, ReplicaError> {
        lock(self.slot(name)?).get(key)
    }

    /// `SET` against one replica.
    pub fn set(&self, name: &str, key: &Key, value: &str) -> Result<(), ReplicaError> {
        lock(self.slot(name)?).set(key, value)
    }

    /// `name.MERGE(peer)`: pull `peer`'s unseen writes into `name`.
    ///
    /// Unknown names and self-merges fail before either replica is touched.
    pub fn merge(&self, name: &str, peer: &str) -> Result<MergeReport, ReplicaError> {
        let target_slot = self.slot(name)?;
        let peer_slot = self.slot(peer)?;
        if std::ptr::eq(target_slot, peer_slot) {
            return Err(ReplicaError::Misuse(format!(
                "replica {name} cannot merge with itself"
            )));
        }

        let (mut target, mut source) = if name.to_lowercase() < peer.to_lowercase() {
            let target = lock(target_slot);
            (target, lock(peer_slot))
        } else {
            let source = lock(peer_slot);
            (lock(target_slot), source)
        };
        target.merge_from(&mut source)
    }

    /// Run `f` with shared access to one replica.
    pub fn inspect<R>(&self, name: &str, f: impl FnOnce(&Replica) -> R) -> Result<R, ReplicaError> {
        Ok(f(&lock(self.slot(name)?)))
    }
}
