use std::fmt;
use std::sync::Arc;

use crate::clock::{Clock, Timestamp};
use crate::error::ReplicaError;
use crate::op::{check_field, Key, Operation, Origin};
use crate::oplog::OperationLog;
use crate::store::{GradeStore, MemoryStore};

/// A named participant holding its own copy of the data and its own log.
///
/// Every `get` and `set` goes through the store and is then recorded in the
/// log; [`merge_from`](Replica::merge_from) reconciles with a peer.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use gradesync::clock::WallClock;
/// use gradesync::{Key, Replica};
///
/// let clock = Arc::new(WallClock::new());
/// let mut pg = Replica::in_memory("postgresql", clock.clone());
/// let mut mongo = Replica::in_memory("mongodb", clock);
///
/// let key = Key::new("s1", "c1");
/// pg.set(&key, "A").unwrap();
/// mongo.set(&key, "B").unwrap();
///
/// pg.merge_from(&mut mongo).unwrap();
/// assert_eq!(pg.get(&key).unwrap().as_deref(), Some("B"));
/// ```
pub struct Replica {
    name: String,
    log: OperationLog,
    store: Box<dyn GradeStore>,
    clock: Arc<dyn Clock>,
}

impl Replica {
    /// Assemble a replica from its log and store.
    ///
    /// The name is lower-cased; peers look each other up case-insensitively.
    pub fn new(
        name: &str,
        log: OperationLog,
        store: Box<dyn GradeStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.to_lowercase(),
            log,
            store,
            clock,
        }
    }

    /// A replica with an in-memory store and an unpersisted log.
    pub fn in_memory(name: &str, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            name,
            OperationLog::in_memory(name),
            Box::new(MemoryStore::new()),
            clock,
        )
    }

    /// Replica name (lower-cased).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The replica's operation log.
    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    /// Name of the backing store.
    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Read the current value for `key`.
    ///
    /// A `GET` is logged on hit and on miss. A missing key is `Ok(None)`.
    pub fn get(&mut self, key: &Key) -> Result<Option<String>, ReplicaError> {
        key.validate()?;
        let value = self.store.get(key)?;
        self.log
            .append(Operation::get(self.clock.now(), key.clone()))?;
        Ok(value)
    }

    /// Write `value` under `key`.
    ///
    /// The store write happens first; the `SET` is logged only once it
    /// succeeded. If logging then fails the store keeps the value and the
    /// persistence error is returned.
    pub fn set(&mut self, key: &Key, value: &str) -> Result<(), ReplicaError> {
        key.validate()?;
        check_field("value", value)?;
        self.apply(key, value, None)
    }

    pub(crate) fn apply(
        &mut self,
        key: &Key,
        value: &str,
        origin: Option<Origin>,
    ) -> Result<(), ReplicaError> {
        self.store.set(key, value)?;
        let mut op = Operation::set(self.clock.now(), key.clone(), value);
        op.origin = origin;
        self.log.append(op)?;
        Ok(())
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub(crate) fn log_mut(&mut self) -> &mut OperationLog {
        &mut self.log
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("name", &self.name)
            .field("backend", &self.store.backend())
            .field("operations", &self.log.len())
            .finish()
    }
}
