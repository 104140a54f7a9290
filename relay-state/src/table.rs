//! The state connection table: concurrent mapping from connection id to state record (§3).

use std::sync::Mutex;

use dashmap::DashMap;

use crate::record::ConnectionRecord;

/// Sharded map from connection id to its state record. Writes are per-conn-id and never cross
/// connections (§5), so a per-entry `Mutex` is enough — no record is ever locked alongside
/// another.
#[derive(Debug, Default)]
pub struct StateTable {
    inner: DashMap<u64, Mutex<ConnectionRecord>>,
}

impl StateTable {
    /// An empty table.
    pub fn new() -> Self {
        Self { inner: DashMap::new() }
    }

    /// Number of records currently tracked.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Inserts a record, replacing any existing one for the same connection id.
    pub fn insert(&self, record: ConnectionRecord) {
        self.inner.insert(record.conn_id(), Mutex::new(record));
    }

    /// Removes the record for `conn_id`, if any.
    pub fn remove(&self, conn_id: u64) -> Option<ConnectionRecord> {
        self.inner.remove(&conn_id).map(|(_, lock)| lock.into_inner().unwrap())
    }

    /// Runs `f` against the record for `conn_id` if one exists, returning its result.
    pub fn with_record<T>(&self, conn_id: u64, f: impl FnOnce(&mut ConnectionRecord) -> T) -> Option<T> {
        let entry = self.inner.get(&conn_id)?;
        let mut record = entry.lock().unwrap();
        Some(f(&mut record))
    }

    /// Every connection id currently tracked, snapshotted at call time.
    pub fn conn_ids(&self) -> Vec<u64> {
        self.inner.iter().map(|entry| *entry.key()).collect()
    }
}
