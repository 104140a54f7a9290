//! Plain configuration knobs (§6). Loading these from a file or environment is out of scope
//! for this crate — constructing a [`GatewayConfig`] or [`StateConfig`] is the caller's job.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Knobs that shape the gateway's reactor pool, worker pool, and command channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Number of reactor threads, each owning one event notifier.
    pub reactor_count: usize,
    /// Buffer size of the new-connection channel handed from accept threads to reactors.
    pub accept_queue_size: usize,
    /// Event batch size per `wait` call on a reactor's notifier.
    pub wait_queue_size: usize,
    /// Maximum number of concurrent per-frame handler tasks.
    pub worker_pool_size: usize,
    /// Buffer size of the gateway command channel (§4.5).
    pub command_channel_size: usize,
    /// Global connection cap enforced at accept time.
    pub max_tcp: u32,
    /// Largest frame payload length the codec will accept.
    pub max_frame_len: u32,
    /// Per-frame read deadline (§4.1). Defaults to 120s.
    pub read_deadline: Duration,
    /// Bound on the graceful-shutdown wait (§5).
    pub shutdown_grace: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            reactor_count: 4,
            accept_queue_size: 4096,
            wait_queue_size: 1024,
            worker_pool_size: 256,
            command_channel_size: 4096,
            max_tcp: 1_000_000,
            max_frame_len: 1 << 20,
            read_deadline: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Knobs that shape the state service's login-slot partitioning, heartbeat, and retry
/// schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfig {
    /// Inclusive contiguous slot ids this process owns (§3, §4.8).
    pub login_slot_range: (u64, u64),
    /// Total number of slots in the fleet-wide partition.
    pub login_slot_count: u64,
    /// How long a connection may go without a heartbeat before it is considered dead.
    pub heartbeat_interval: Duration,
    /// Delay before the first (and each subsequent) retry of an unacked push.
    pub retry_backoff: Duration,
    /// Maximum number of retry attempts before a push is dropped.
    pub retry_max_attempts: u32,
    /// Buffer size of the state-side command-producing queue into the gateway sink.
    pub command_channel_size: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            login_slot_range: (0, 15),
            login_slot_count: 16,
            heartbeat_interval: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(3),
            retry_max_attempts: 5,
            command_channel_size: 4096,
        }
    }
}

impl StateConfig {
    /// The slots this process owns, per its configured range.
    pub fn owned_slots(&self) -> impl Iterator<Item = u64> {
        self.login_slot_range.0..=self.login_slot_range.1
    }

    /// The slot a given connection id is sharded into.
    pub fn slot_for(&self, conn_id: u64) -> u64 {
        conn_id % self.login_slot_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_slots_covers_inclusive_range() {
        let cfg = StateConfig {
            login_slot_range: (2, 4),
            ..Default::default()
        };
        assert_eq!(cfg.owned_slots().collect::<Vec<_>>(), vec![2, 3, 4]);
    }
}
