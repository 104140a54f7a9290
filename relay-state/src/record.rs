//! The per-connection state machine (§4.6, §3 "Connection-state record").

use std::time::{Duration, Instant};

use relay_common::message::PushMsg;

/// The states a connection's record moves through (§4.6). There is no explicit `Absent`
/// variant here: absence is modeled by the record's absence from [`crate::table::StateTable`]
/// rather than as a stored state, since a `Closed` record is removed rather than retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Login has completed; the record is live and tracked for heartbeat and push.
    LoggedIn,
    /// The connection has logged out, timed out, or been cancelled.
    Closed,
}

/// An outstanding downstream push together with its retry bookkeeping.
#[derive(Debug, Clone)]
pub struct OutstandingPush {
    /// The message itself, including the `msgTimerLock` token (§ GLOSSARY).
    pub msg: PushMsg,
    /// When this push was last (re)armed.
    pub armed_at: Instant,
    /// How many times it has been retransmitted.
    pub attempts: u32,
}

/// State held for one logged-in connection.
///
/// Invariants (§3): a record exists iff the connection has completed login and not logged
/// out; `last_push` is non-empty iff an unacknowledged downstream push is outstanding; at most
/// one outstanding push per connection.
#[derive(Debug)]
pub struct ConnectionRecord {
    conn_id: u64,
    device_id: u64,
    /// The gateway endpoint (`"<ip>:<port>"`) that owns this connection's socket, used to
    /// route `DelConn`/`Push` commands back (§6). `None` for a record rehydrated by crash
    /// recovery (§4.8): no socket exists anywhere yet, so there is nothing to route to until
    /// the client reconnects and overwrites the router record.
    endpoint: Option<String>,
    lifecycle: Lifecycle,
    heartbeat_deadline: Instant,
    last_push: Option<OutstandingPush>,
}

impl ConnectionRecord {
    /// Creates a freshly logged-in record with its heartbeat deadline set to `now + interval`.
    pub fn new(conn_id: u64, device_id: u64, endpoint: String, heartbeat_interval: Duration) -> Self {
        Self {
            conn_id,
            device_id,
            endpoint: Some(endpoint),
            lifecycle: Lifecycle::LoggedIn,
            heartbeat_deadline: Instant::now() + heartbeat_interval,
            last_push: None,
        }
    }

    /// Creates a record with no known owning gateway, as produced by crash recovery (§4.8).
    pub fn recovered(conn_id: u64, device_id: u64, heartbeat_interval: Duration) -> Self {
        Self {
            conn_id,
            device_id,
            endpoint: None,
            lifecycle: Lifecycle::LoggedIn,
            heartbeat_deadline: Instant::now() + heartbeat_interval,
            last_push: None,
        }
    }

    /// The connection id this record belongs to.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// The device identity that logged this connection in.
    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    /// The gateway endpoint that owns this connection's socket, if known.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// The record's current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Refreshes the heartbeat deadline; no persistent write accompanies this (§4.6).
    pub fn refresh_heartbeat(&mut self, heartbeat_interval: Duration) {
        self.heartbeat_deadline = Instant::now() + heartbeat_interval;
    }

    /// Whether the heartbeat deadline has passed.
    pub fn is_heartbeat_expired(&self) -> bool {
        Instant::now() >= self.heartbeat_deadline
    }

    /// Transitions the record to `Closed`.
    pub fn mark_closed(&mut self) {
        self.lifecycle = Lifecycle::Closed;
    }

    /// Arms a new outstanding push, replacing any previous one.
    pub fn arm_push(&mut self, msg: PushMsg) {
        self.last_push = Some(OutstandingPush {
            msg,
            armed_at: Instant::now(),
            attempts: 0,
        });
    }

    /// The currently outstanding push, if any.
    pub fn outstanding_push(&self) -> Option<&OutstandingPush> {
        self.last_push.as_ref()
    }

    /// Clears the outstanding push if its `msgTimerLock` matches `(session_id, msg_id)`,
    /// returning whether it matched. A mismatch is a stale ack and is a no-op (§4.6).
    pub fn ack(&mut self, session_id: u64, msg_id: u64) -> bool {
        let matched = self
            .last_push
            .as_ref()
            .is_some_and(|push| push.msg.session_id == session_id && push.msg.msg_id == msg_id);
        if matched {
            self.last_push = None;
        }
        matched
    }

    /// Records a retry attempt against the outstanding push. Returns the message to resend if
    /// the attempt budget is not yet exhausted; drops the push (without tearing down the
    /// connection) and returns `None` once `max_attempts` is exceeded (§4.7).
    pub fn retry_or_drop(&mut self, max_attempts: u32) -> Option<PushMsg> {
        let push = self.last_push.as_mut()?;
        push.attempts += 1;
        push.armed_at = Instant::now();
        if push.attempts > max_attempts {
            let dropped = self.last_push.take().expect("checked Some above");
            log::warn!(
                "push {} for connection {} exhausted its retry budget; dropping",
                dropped.msg.timer_lock(),
                self.conn_id
            );
            None
        } else {
            self.last_push.as_ref().map(|push| push.msg.clone())
        }
    }

    /// Moves this record's outstanding push onto `new_record`, resolving the open question in
    /// §9: a re-login migrates `last_push` to the new connection id rather than dropping it.
    pub fn migrate_push_into(&mut self, new_record: &mut ConnectionRecord) {
        if let Some(push) = self.last_push.take() {
            new_record.last_push = Some(push);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(session_id: u64, msg_id: u64) -> PushMsg {
        PushMsg {
            session_id,
            msg_id,
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn ack_clears_only_on_matching_lock() {
        let mut record = ConnectionRecord::new(1, 100, "gw-a:9000".to_string(), Duration::from_secs(30));
        record.arm_push(push(7, 42));
        assert!(!record.ack(7, 41), "a stale ack must not clear the push");
        assert!(record.outstanding_push().is_some());
        assert!(record.ack(7, 42));
        assert!(record.outstanding_push().is_none());
    }

    #[test]
    fn retry_drops_after_max_attempts() {
        let mut record = ConnectionRecord::new(1, 100, "gw-a:9000".to_string(), Duration::from_secs(30));
        record.arm_push(push(7, 42));
        assert!(record.retry_or_drop(2).is_some());
        assert!(record.retry_or_drop(2).is_some());
        assert!(record.retry_or_drop(2).is_none());
        assert!(record.outstanding_push().is_none());
    }

    #[test]
    fn migrate_push_moves_outstanding_push_to_new_record() {
        let mut old = ConnectionRecord::new(1, 100, "gw-a:9000".to_string(), Duration::from_secs(30));
        old.arm_push(push(7, 42));
        let mut fresh = ConnectionRecord::new(2, 100, "gw-a:9000".to_string(), Duration::from_secs(30));
        old.migrate_push_into(&mut fresh);
        assert!(old.outstanding_push().is_none());
        assert_eq!(fresh.outstanding_push().unwrap().msg.msg_id, 42);
    }
}
