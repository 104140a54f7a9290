//! Device-to-endpoint routing seam (§1, §4.6).
//!
//! Service discovery and cross-process routing are out of scope for this crate (§1's
//! Non-goals) — the gateway and state service this repo builds are one participant in a
//! larger fleet. [`Router`] is the seam the login transition uses to record and look up which
//! endpoint currently owns a device's connection; [`InMemoryRouter`] is a same-process
//! implementation suitable for a single-node deployment or for tests.

use std::collections::HashMap;
use std::sync::Mutex;

/// Where a device's live connection currently lives.
pub trait Router: Send + Sync {
    /// Records that `device_id`'s connection `conn_id` is now being served by `endpoint`.
    fn add_record(&self, device_id: u64, endpoint: &str, conn_id: u64);

    /// Removes the routing record for `device_id` iff it currently points at `conn_id`.
    fn remove_record(&self, device_id: u64, conn_id: u64);

    /// The endpoint and connection id currently serving `device_id`, if any.
    fn lookup(&self, device_id: u64) -> Option<(String, u64)>;
}

/// A same-process [`Router`] backed by a plain map. Fine for a single-node deployment; a
/// multi-node fleet needs a shared directory service instead, which is outside this crate.
#[derive(Debug, Default)]
pub struct InMemoryRouter {
    records: Mutex<HashMap<u64, (String, u64)>>,
}

impl InMemoryRouter {
    /// An empty router.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Router for InMemoryRouter {
    fn add_record(&self, device_id: u64, endpoint: &str, conn_id: u64) {
        self.records.lock().unwrap().insert(device_id, (endpoint.to_string(), conn_id));
    }

    fn remove_record(&self, device_id: u64, conn_id: u64) {
        let mut records = self.records.lock().unwrap();
        if let Some((_, current_conn)) = records.get(&device_id) {
            if *current_conn == conn_id {
                records.remove(&device_id);
            }
        }
    }

    fn lookup(&self, device_id: u64) -> Option<(String, u64)> {
        self.records.lock().unwrap().get(&device_id).cloned()
    }
}
