//! Login-slot key formats, (de)serialization of slot entries, and crash recovery (§3, §4.8).

use std::sync::Arc;
use std::thread;

use log::{error, info};
use relay_common::StateConfig;

use crate::cache::Cache;
use crate::error::StateError;
use crate::record::ConnectionRecord;
use crate::table::StateTable;

/// 7 days, the TTL on the max-client-id counter (§6).
pub const MAX_CLIENT_ID_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// `login_slot:<slot>` — set of `"<device_id>|<conn_id>"`, no TTL (§6).
pub fn login_slot_key(slot: u64) -> String {
    format!("login_slot:{slot}")
}

/// `max_client_id:<slot>:<conn_id>:<session_id>` — 64-bit counter, TTL 7 days (§6).
pub fn max_client_id_key(slot: u64, conn_id: u64, session_id: u64) -> String {
    format!("max_client_id:{slot}:{conn_id}:{session_id}")
}

/// `last_msg:<slot>:<conn_id>` — serialized `PushMsg`, no TTL, cleared on ack (§6).
pub fn last_msg_key(slot: u64, conn_id: u64) -> String {
    format!("last_msg:{slot}:{conn_id}")
}

/// Serializes a login-slot entry as `"<device_id>|<conn_id>"`.
pub fn marshal(device_id: u64, conn_id: u64) -> String {
    format!("{device_id}|{conn_id}")
}

/// Parses a login-slot entry back into `(device_id, conn_id)`.
pub fn unmarshal(entry: &str) -> Result<(u64, u64), StateError> {
    let (device_id, conn_id) = entry
        .split_once('|')
        .ok_or_else(|| StateError::MalformedLoginSlotEntry(entry.to_string()))?;
    let device_id = device_id
        .parse()
        .map_err(|_| StateError::MalformedLoginSlotEntry(entry.to_string()))?;
    let conn_id = conn_id
        .parse()
        .map_err(|_| StateError::MalformedLoginSlotEntry(entry.to_string()))?;
    Ok((device_id, conn_id))
}

/// Scans every slot this process owns and rehydrates the state table from the persisted
/// entries, without attempting to re-establish any TCP socket (§4.8).
///
/// Slots are scanned in parallel, matching the original's per-slot goroutine. A scan failure
/// on any slot is propagated to the caller, who must treat it as startup-fatal (§4.8, §7): a
/// process that cannot recover its owned partition must not serve traffic that belongs to it.
pub fn recover_owned_slots(
    cache: &Arc<dyn Cache>,
    config: &StateConfig,
    table: &Arc<StateTable>,
) -> Result<(), StateError> {
    let outcomes: Vec<Result<usize, StateError>> = thread::scope(|scope| {
        config
            .owned_slots()
            .map(|slot| {
                let cache = Arc::clone(cache);
                let table = Arc::clone(table);
                let heartbeat_interval = config.heartbeat_interval;
                scope
                    .spawn(move || recover_one_slot(slot, &cache, &table, heartbeat_interval))
                    .join()
                    .unwrap_or_else(|_| Err(StateError::MalformedLoginSlotEntry(format!("slot {slot} panicked"))))
            })
            .collect()
    });

    let mut total = 0usize;
    for outcome in outcomes {
        total += outcome?;
    }
    info!("recovered {total} connection(s) across {} owned login slot(s)", config.owned_slots().count());
    Ok(())
}

fn recover_one_slot(
    slot: u64,
    cache: &Arc<dyn Cache>,
    table: &Arc<StateTable>,
    heartbeat_interval: std::time::Duration,
) -> Result<usize, StateError> {
    let key = login_slot_key(slot);
    let entries = cache.smembers(&key)?;
    let mut recovered = 0usize;
    for entry in entries {
        match unmarshal(&entry) {
            Ok((device_id, conn_id)) => {
                let mut record = ConnectionRecord::recovered(conn_id, device_id, heartbeat_interval);
                if let Some(bytes) = cache.get_bytes(&last_msg_key(slot, conn_id))? {
                    match bincode::deserialize(&bytes) {
                        Ok(msg) => record.arm_push(msg),
                        Err(e) => error!("slot {slot}: skipping unparseable last-push for connection {conn_id}: {e}"),
                    }
                }
                table.insert(record);
                recovered += 1;
            }
            Err(e) => {
                error!("slot {slot}: skipping unparseable login-slot entry {entry:?}: {e}");
            }
        }
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use std::time::Duration;

    #[test]
    fn marshal_unmarshal_round_trips() {
        assert_eq!(marshal(1001, 42), "1001|42");
        assert_eq!(unmarshal("1001|42").unwrap(), (1001, 42));
    }

    #[test]
    fn unmarshal_rejects_malformed_entries() {
        assert!(unmarshal("no-pipe-here").is_err());
        assert!(unmarshal("abc|42").is_err());
    }

    #[test]
    fn recovery_rehydrates_table_without_touching_sockets() {
        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());
        cache.sadd(&login_slot_key(3), &marshal(1001, 42)).unwrap();

        let config = StateConfig {
            login_slot_range: (0, 15),
            heartbeat_interval: Duration::from_secs(30),
            ..Default::default()
        };
        let table = Arc::new(StateTable::new());
        recover_owned_slots(&cache, &config, &table).unwrap();

        assert_eq!(table.len(), 1);
        let device_id = table.with_record(42, |record| record.device_id()).unwrap();
        assert_eq!(device_id, 1001);
    }
}
