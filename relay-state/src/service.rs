//! Wires the state connection table, durable cache, router, upstream, timer wheel, and
//! gateway outbox into the full per-connection state machine (§4.6–§4.8).

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use relay_common::message::{Command, GatewayCommand, PushMsg};
use relay_common::StateConfig;

use crate::cache::Cache;
use crate::error::StateError;
use crate::login_slot::{
    last_msg_key, login_slot_key, marshal, max_client_id_key, recover_owned_slots, MAX_CLIENT_ID_TTL_SECS,
};
use crate::outbox::Outbox;
use crate::record::{ConnectionRecord, Lifecycle};
use crate::router::Router;
use crate::sink::GatewayRegistry;
use crate::table::StateTable;
use crate::timer::{Entry, TimerKind, TimerWheel};
use crate::upstream::Upstream;

/// The fully wired per-connection state machine (§4.6).
///
/// Constructed once per process via [`StateService::spawn`], then shared behind an `Arc` by
/// every RPC handler thread that decodes an incoming [`Command`] and calls [`dispatch`].
///
/// [`dispatch`]: StateService::dispatch
pub struct StateService {
    config: StateConfig,
    table: Arc<StateTable>,
    cache: Arc<dyn Cache>,
    router: Arc<dyn Router>,
    upstream: Arc<dyn Upstream>,
    gateways: Arc<GatewayRegistry>,
    outbox: Outbox,
    timers: Arc<TimerWheel>,
    timer_thread: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StateService {
    /// Builds a `StateService` and starts its timer-wheel thread and its gateway outbox
    /// thread. Does not perform crash recovery — call [`StateService::recover`] separately
    /// once, before accepting traffic.
    pub fn spawn(
        config: StateConfig,
        cache: Arc<dyn Cache>,
        router: Arc<dyn Router>,
        upstream: Arc<dyn Upstream>,
        gateways: Arc<GatewayRegistry>,
    ) -> Arc<Self> {
        let outbox = Outbox::spawn(Arc::clone(&gateways), config.command_channel_size);
        let service = Arc::new(Self {
            config,
            table: Arc::new(StateTable::new()),
            cache,
            router,
            upstream,
            gateways,
            outbox,
            timers: Arc::new(TimerWheel::new()),
            timer_thread: std::sync::Mutex::new(None),
        });

        let timers = Arc::clone(&service.timers);
        let fire_target = Arc::clone(&service);
        let handle = thread::Builder::new()
            .name("relay-state-timers".into())
            .spawn(move || timers.run(move |entry| fire_target.on_timer_fire(entry)))
            .expect("failed to spawn state timer thread");
        *service.timer_thread.lock().unwrap() = Some(handle);

        service
    }

    /// Scans this process's owned login slots and rehydrates the state table (§4.8), then
    /// arms a heartbeat timer (and, for every record that recovered an outstanding push, a
    /// retry timer) for each recovered record. Must run once at startup before traffic is
    /// accepted; a failure here is startup-fatal (§7) and is propagated for the caller to
    /// abort the process on.
    pub fn recover(&self) -> Result<(), StateError> {
        recover_owned_slots(&self.cache, &self.config, &self.table)?;
        for conn_id in self.table.conn_ids() {
            self.schedule_heartbeat(conn_id);
            let outstanding = self
                .table
                .with_record(conn_id, |record| record.outstanding_push().map(|push| push.msg.clone()))
                .flatten();
            if let Some(msg) = outstanding {
                self.timers
                    .schedule(Entry::retry(conn_id, msg.timer_lock(), Instant::now() + self.config.retry_backoff));
            }
        }
        Ok(())
    }

    /// The underlying connection-state table, for introspection by callers (metrics, tests).
    pub fn table(&self) -> &Arc<StateTable> {
        &self.table
    }

    /// The gateway registry backing this service's outbound command routing, so a caller
    /// (typically the binary that assembles a deployment) can register each gateway's sink as
    /// it comes up.
    pub fn gateways(&self) -> &Arc<GatewayRegistry> {
        &self.gateways
    }

    /// Dispatches a decoded client command, arriving over connection `conn_id` on the gateway
    /// at `endpoint` (§6's `gateway_endpoint`). This is the seam a `relay_gateway::StateClient`
    /// adapter calls into.
    pub fn dispatch(&self, endpoint: &str, conn_id: u64, command: Command) {
        match command {
            Command::Login { device_id } => {
                if let Err(e) = self.login(conn_id, device_id, endpoint) {
                    warn!("login failed for connection {conn_id} device {device_id}: {e}");
                }
            }
            Command::Heartbeat => self.heartbeat(conn_id),
            Command::Ack { session_id, msg_id } => self.ack(conn_id, session_id, msg_id),
            Command::UpMessage {
                session_id,
                client_id,
                payload,
            } => self.up_message(conn_id, session_id, client_id, &payload),
            Command::Reconnect { old_conn_id } => self.reconnect(conn_id, old_conn_id),
        }
    }

    /// The gateway reports that `conn_id`'s socket is gone (EOF, protocol error, or remote
    /// close). Equivalent to a heartbeat-timeout cancel but triggered immediately (§4.6).
    pub fn notify_closed(&self, conn_id: u64) {
        self.cancel(conn_id);
    }

    /// `Absent → LoggedIn` (§4.6). If a previous connection for the same device is still
    /// logged in elsewhere, its outstanding push (if any) migrates to this connection and the
    /// old connection is torn down (§9's resolved open question).
    pub fn login(&self, conn_id: u64, device_id: u64, endpoint: &str) -> Result<(), StateError> {
        let slot = self.config.slot_for(conn_id);
        self.cache.sadd(&login_slot_key(slot), &marshal(device_id, conn_id))?;

        let mut record = ConnectionRecord::new(conn_id, device_id, endpoint.to_string(), self.config.heartbeat_interval);

        if let Some((_, old_conn_id)) = self.router.lookup(device_id) {
            if old_conn_id != conn_id {
                self.migrate_from(old_conn_id, &mut record)?;
            }
        }

        self.router.add_record(device_id, endpoint, conn_id);
        self.table.insert(record);
        self.schedule_heartbeat(conn_id);
        Ok(())
    }

    /// `LoggedIn → LoggedIn` on heartbeat: refreshes the deadline only, no persistent write
    /// (§4.6).
    pub fn heartbeat(&self, conn_id: u64) {
        let refreshed = self
            .table
            .with_record(conn_id, |record| record.refresh_heartbeat(self.config.heartbeat_interval));
        if refreshed.is_none() {
            debug!("heartbeat for unknown connection {conn_id}");
        }
    }

    /// `LoggedIn → LoggedIn` on up-message: deduplicates via compare-and-increment and, on
    /// success, forwards upstream (§4.6).
    pub fn up_message(&self, conn_id: u64, session_id: u64, client_id: u64, payload: &[u8]) {
        let logged_in = self
            .table
            .with_record(conn_id, |record| record.lifecycle() == Lifecycle::LoggedIn)
            .unwrap_or(false);
        if !logged_in {
            warn!("up-message for connection {conn_id} with no logged-in record; dropping");
            return;
        }

        let slot = self.config.slot_for(conn_id);
        let key = max_client_id_key(slot, conn_id, session_id);
        let expected_prev = client_id.saturating_sub(1);
        let ttl = Duration::from_secs(MAX_CLIENT_ID_TTL_SECS);
        match self.cache.compare_and_increment(&key, expected_prev, ttl) {
            Ok(true) => self.upstream.forward(conn_id, session_id, payload),
            Ok(false) => debug!(
                "dropping duplicate/out-of-order up-message: connection={conn_id} session={session_id} client_id={client_id}"
            ),
            Err(e) => warn!("compare-and-increment failed for connection {conn_id}: {e}"),
        }
    }

    /// `LoggedIn → LoggedIn` on push: an externally-triggered delivery request (the domain
    /// system that decides *what* to push is out of scope, §1). Persists the push, arms its
    /// retry timer, and emits a `Push` command to the owning gateway (§4.6).
    pub fn push(&self, conn_id: u64, msg: PushMsg) -> Result<(), StateError> {
        let endpoint = self.table.with_record(conn_id, |record| {
            record.arm_push(msg.clone());
            record.endpoint().map(str::to_string)
        });
        let Some(endpoint) = endpoint else {
            return Err(StateError::UnknownConnection(conn_id));
        };

        self.persist_and_arm_retry(conn_id, &msg)?;
        match endpoint {
            Some(endpoint) => self.outbox.submit(endpoint, conn_id, GatewayCommand::Push { payload: msg.payload }),
            None => warn!("armed a push for connection {conn_id} with no known gateway endpoint yet"),
        }
        Ok(())
    }

    /// `LoggedIn → LoggedIn` on ack: clears the outstanding push iff the token matches;
    /// otherwise it is a stale ack and is ignored (§4.6).
    pub fn ack(&self, conn_id: u64, session_id: u64, msg_id: u64) {
        let matched = self.table.with_record(conn_id, |record| record.ack(session_id, msg_id));
        match matched {
            Some(true) => {
                let slot = self.config.slot_for(conn_id);
                if let Err(e) = self.cache.del(&last_msg_key(slot, conn_id)) {
                    warn!("failed to clear last-push slot for connection {conn_id}: {e}");
                }
            }
            Some(false) => debug!("stale ack for connection {conn_id}: session={session_id} msg={msg_id}"),
            None => debug!("ack for unknown connection {conn_id}"),
        }
    }

    /// Explicitly evicts `old_conn_id` in favor of `conn_id`, migrating any outstanding push
    /// across (§4.6's `Reconnect` command, a client-driven counterpart to the router-based
    /// migration `login` performs automatically).
    pub fn reconnect(&self, conn_id: u64, old_conn_id: u64) {
        if conn_id == old_conn_id {
            return;
        }
        let Some(mut old_record) = self.table.remove(old_conn_id) else {
            debug!("reconnect referenced unknown old connection {old_conn_id}");
            return;
        };
        old_record.mark_closed();
        let old_slot = self.config.slot_for(old_conn_id);
        if let Err(e) = self.cache.srem(&login_slot_key(old_slot), &marshal(old_record.device_id(), old_conn_id)) {
            warn!("failed to remove login-slot entry for connection {old_conn_id}: {e}");
        }
        self.router.remove_record(old_record.device_id(), old_conn_id);

        let migrated_msg = self
            .table
            .with_record(conn_id, |record| {
                old_record.migrate_push_into(record);
                record.outstanding_push().map(|push| push.msg.clone())
            })
            .flatten();

        if let Some(msg) = migrated_msg {
            if let Err(e) = self.persist_and_arm_retry(conn_id, &msg) {
                warn!("failed to persist push migrated to connection {conn_id}: {e}");
            }
        }
        if let Err(e) = self.cache.del(&last_msg_key(old_slot, old_conn_id)) {
            warn!("failed to clear last-push slot for connection {old_conn_id}: {e}");
        }

        if let Some(endpoint) = old_record.endpoint() {
            self.outbox
                .submit(endpoint.to_string(), old_conn_id, GatewayCommand::DelConn);
        }
    }

    /// `LoggedIn → Closed` on cancel or heartbeat-timeout: removes the record, the login-slot
    /// entry, the router record, and emits an idempotent `DelConn` (§4.6).
    pub fn cancel(&self, conn_id: u64) {
        let Some(mut record) = self.table.remove(conn_id) else {
            return;
        };
        record.mark_closed();
        let slot = self.config.slot_for(conn_id);
        if let Err(e) = self.cache.srem(&login_slot_key(slot), &marshal(record.device_id(), conn_id)) {
            warn!("failed to remove login-slot entry for connection {conn_id}: {e}");
        }
        if let Err(e) = self.cache.del(&last_msg_key(slot, conn_id)) {
            warn!("failed to clear last-push slot for connection {conn_id}: {e}");
        }
        self.router.remove_record(record.device_id(), conn_id);
        if let Some(endpoint) = record.endpoint() {
            self.outbox.submit(endpoint.to_string(), conn_id, GatewayCommand::DelConn);
        }
    }

    fn migrate_from(&self, old_conn_id: u64, new_record: &mut ConnectionRecord) -> Result<(), StateError> {
        let Some(mut old_record) = self.table.remove(old_conn_id) else {
            return Ok(());
        };
        old_record.migrate_push_into(new_record);

        let old_slot = self.config.slot_for(old_conn_id);
        self.cache.del(&last_msg_key(old_slot, old_conn_id))?;
        self.cache
            .srem(&login_slot_key(old_slot), &marshal(old_record.device_id(), old_conn_id))?;

        if let Some(msg) = new_record.outstanding_push().map(|push| push.msg.clone()) {
            self.persist_and_arm_retry(new_record.conn_id(), &msg)?;
        }

        if let Some(endpoint) = old_record.endpoint() {
            self.outbox
                .submit(endpoint.to_string(), old_conn_id, GatewayCommand::DelConn);
        }
        Ok(())
    }

    fn persist_and_arm_retry(&self, conn_id: u64, msg: &PushMsg) -> Result<(), StateError> {
        let slot = self.config.slot_for(conn_id);
        let bytes = bincode::serialize(msg)?;
        self.cache.set_bytes(&last_msg_key(slot, conn_id), &bytes, None)?;
        self.timers
            .schedule(Entry::retry(conn_id, msg.timer_lock(), Instant::now() + self.config.retry_backoff));
        Ok(())
    }

    fn schedule_heartbeat(&self, conn_id: u64) {
        self.timers
            .schedule(Entry::heartbeat(conn_id, Instant::now() + self.config.heartbeat_interval));
    }

    fn on_timer_fire(&self, entry: Entry) {
        match entry.kind {
            TimerKind::Heartbeat => self.on_heartbeat_timer(entry.conn_id),
            TimerKind::Retry { msg_timer_lock } => self.on_retry_timer(entry.conn_id, &msg_timer_lock),
        }
    }

    fn on_heartbeat_timer(&self, conn_id: u64) {
        let expired = self.table.with_record(conn_id, |record| record.is_heartbeat_expired());
        match expired {
            Some(true) => {
                info!("connection {conn_id} heartbeat deadline elapsed; closing");
                self.cancel(conn_id);
            }
            // Still within its deadline (the record was refreshed since this entry was
            // scheduled) — re-arm rather than maintain a separate cancellation path for the
            // stale entry.
            Some(false) => self.schedule_heartbeat(conn_id),
            None => {}
        }
    }

    fn on_retry_timer(&self, conn_id: u64, msg_timer_lock: &str) {
        let result = self.table.with_record(conn_id, |record| {
            let still_current = record
                .outstanding_push()
                .is_some_and(|push| push.msg.timer_lock() == msg_timer_lock);
            if !still_current {
                return None;
            }
            record
                .retry_or_drop(self.config.retry_max_attempts)
                .map(|msg| (msg, record.endpoint().map(str::to_string)))
        });

        if let Some(Some((msg, endpoint))) = result {
            if let Some(endpoint) = endpoint {
                self.outbox
                    .submit(endpoint, conn_id, GatewayCommand::Push { payload: msg.payload.clone() });
            }
            self.timers
                .schedule(Entry::retry(conn_id, msg.timer_lock(), Instant::now() + self.config.retry_backoff));
        }
    }

    /// Signals the timer-wheel thread to drain and exit.
    pub fn shutdown(&self) {
        self.timers.shutdown();
    }
}

impl Drop for StateService {
    fn drop(&mut self) {
        self.timers.shutdown();
        if let Some(handle) = self.timer_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for StateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateService")
            .field("connections", &self.table.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::router::InMemoryRouter;
    use crate::sink::ChannelGatewaySink;
    use crate::upstream::NullUpstream;
    use fake::{Fake, Faker};
    use relay_common::message::CmdContext;
    use std::time::Duration as StdDuration;

    fn test_service(config: StateConfig) -> (Arc<StateService>, crossbeam_channel::Receiver<CmdContext>) {
        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());
        let router: Arc<dyn Router> = Arc::new(InMemoryRouter::new());
        let upstream: Arc<dyn Upstream> = Arc::new(NullUpstream);
        let gateways = Arc::new(GatewayRegistry::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        gateways.register("gw-a:9000", Arc::new(ChannelGatewaySink::new(tx)));
        (StateService::spawn(config, cache, router, upstream, gateways), rx)
    }

    fn recv(rx: &crossbeam_channel::Receiver<CmdContext>) -> CmdContext {
        rx.recv_timeout(StdDuration::from_secs(2)).expect("expected a gateway command")
    }

    #[test]
    fn login_then_heartbeat_keeps_record_logged_in() {
        let (service, _rx) = test_service(StateConfig::default());
        service.login(1, 1001, "gw-a:9000").unwrap();
        service.heartbeat(1);
        assert_eq!(
            service.table().with_record(1, |r| r.lifecycle()).unwrap(),
            Lifecycle::LoggedIn
        );
    }

    #[test]
    fn login_accepts_a_randomized_device_id() {
        let (service, _rx) = test_service(StateConfig::default());
        let device_id: u64 = Faker.fake();
        service.login(1, device_id, "gw-a:9000").unwrap();
        assert_eq!(
            service.table().with_record(1, |r| r.device_id()).unwrap(),
            device_id
        );
    }

    #[test]
    fn dedup_drops_replayed_and_skipped_client_ids() {
        let (service, _rx) = test_service(StateConfig::default());
        service.login(1, 1001, "gw-a:9000").unwrap();

        // This exercises scenario 3 from the testable-properties list: client-ids
        // [1, 2, 2, 3] should see exactly [1, 2, 3] accepted.
        let key = max_client_id_key(service.config.slot_for(1), 1, 7);
        let ttl = Duration::from_secs(MAX_CLIENT_ID_TTL_SECS);
        assert!(service.cache.compare_and_increment(&key, 0, ttl).unwrap());
        assert!(service.cache.compare_and_increment(&key, 1, ttl).unwrap());
        assert!(!service.cache.compare_and_increment(&key, 1, ttl).unwrap());
        assert!(service.cache.compare_and_increment(&key, 2, ttl).unwrap());
    }

    #[test]
    fn push_then_ack_clears_outstanding_push() {
        let (service, rx) = test_service(StateConfig::default());
        service.login(1, 1001, "gw-a:9000").unwrap();

        let msg = PushMsg {
            session_id: 7,
            msg_id: 42,
            payload: b"hello".to_vec(),
        };
        service.push(1, msg).unwrap();
        let ctx = recv(&rx);
        assert_eq!(ctx.conn_id, 1);
        assert!(matches!(ctx.cmd, GatewayCommand::Push { .. }));

        service.ack(1, 7, 42);
        assert!(service
            .table()
            .with_record(1, |r| r.outstanding_push().is_none())
            .unwrap());
    }

    #[test]
    fn push_with_lost_ack_is_retransmitted_once_then_acked() {
        let mut config = StateConfig::default();
        config.retry_backoff = Duration::from_millis(20);
        config.retry_max_attempts = 5;
        let (service, rx) = test_service(config);
        service.login(1, 1001, "gw-a:9000").unwrap();

        let msg = PushMsg {
            session_id: 7,
            msg_id: 99,
            payload: b"payload".to_vec(),
        };
        service.push(1, msg).unwrap();
        let first = recv(&rx);
        assert_eq!(first.conn_id, 1);

        // The retry timer should re-emit the identical frame while unacked.
        let second = recv(&rx);
        assert_eq!(second.cmd, first.cmd);

        service.ack(1, 7, 99);
        // No third transmission should follow; give the timer a moment to (not) fire again.
        assert!(rx.recv_timeout(StdDuration::from_millis(100)).is_err());
    }

    #[test]
    fn cancel_is_idempotent() {
        let (service, rx) = test_service(StateConfig::default());
        service.login(1, 1001, "gw-a:9000").unwrap();

        service.cancel(1);
        let first = recv(&rx);
        assert!(matches!(first.cmd, GatewayCommand::DelConn));

        // A second cancel on an already-gone connection must not panic or emit again.
        service.cancel(1);
        assert!(rx.recv_timeout(StdDuration::from_millis(100)).is_err());
    }

    #[test]
    fn relogin_migrates_outstanding_push_to_the_new_connection() {
        let (service, rx) = test_service(StateConfig::default());
        service.login(1, 1001, "gw-a:9000").unwrap();
        service
            .push(
                1,
                PushMsg {
                    session_id: 3,
                    msg_id: 9,
                    payload: b"migrate-me".to_vec(),
                },
            )
            .unwrap();
        let _first_push = recv(&rx);

        // The same device logs in again under a new connection id before acking.
        service.login(2, 1001, "gw-a:9000").unwrap();

        assert!(service.table().with_record(1, |_| ()).is_none(), "old record should be gone");
        let migrated = service
            .table()
            .with_record(2, |r| r.outstanding_push().map(|p| p.msg.msg_id))
            .flatten();
        assert_eq!(migrated, Some(9));

        let del_conn = recv(&rx);
        assert!(matches!(del_conn.cmd, GatewayCommand::DelConn));
        assert_eq!(del_conn.conn_id, 1);
    }
}
