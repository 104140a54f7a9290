//! The global connection table: every handle the process currently owns, keyed by id.

use std::sync::Arc;

use dashmap::DashMap;

use crate::connection::ConnectionHandle;

/// Sharded map from connection id to its handle, shared across every reactor and worker
/// thread (§5). Each reactor additionally keeps a local `Slab` for token-indexed event
/// dispatch; this table is the one the command dispatcher and RPC layer look connections up
/// in by id.
#[derive(Debug, Default)]
pub struct ConnTable {
    inner: DashMap<u64, Arc<ConnectionHandle>>,
}

impl ConnTable {
    /// An empty table.
    pub fn new() -> Self {
        Self { inner: DashMap::new() }
    }

    /// Number of connections currently tracked.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the table holds no connections.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Inserts a newly accepted connection, replacing any stale entry with the same id.
    pub fn insert(&self, handle: Arc<ConnectionHandle>) {
        self.inner.insert(handle.id(), handle);
    }

    /// Looks up a connection by id.
    pub fn get(&self, conn_id: u64) -> Option<Arc<ConnectionHandle>> {
        self.inner.get(&conn_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes a connection by id, returning its handle if present.
    pub fn remove(&self, conn_id: u64) -> Option<Arc<ConnectionHandle>> {
        self.inner.remove(&conn_id).map(|(_, handle)| handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;

    fn dummy_handle(id: u64) -> Arc<ConnectionHandle> {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let stream = mio::net::TcpStream::from_std(client);
        Arc::new(ConnectionHandle::new(id, stream.peer_addr().unwrap(), stream))
    }

    #[test]
    fn insert_get_remove_round_trip() {
        let table = ConnTable::new();
        let handle = dummy_handle(42);
        table.insert(Arc::clone(&handle));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(42).unwrap().id(), 42);
        assert!(table.get(7).is_none());
        assert_eq!(table.remove(42).unwrap().id(), 42);
        assert!(table.is_empty());
    }
}
