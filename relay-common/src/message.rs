//! Wire-level types shared by the gateway and the state service.
//!
//! The gateway never inspects a client frame's payload — it only moves bytes. The state
//! service is the one side that decodes [`Command`] out of those bytes, and the one side
//! that produces [`PushMsg`] for persistence and [`GatewayCommand`] for the command channel
//! back to the gateway.

use serde::{Deserialize, Serialize};

/// The inner command categories carried inside a client frame's payload (§6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Establishes a login identity for the connection that sent it.
    Login {
        /// The device identity logging in.
        device_id: u64,
    },
    /// Refreshes the connection's heartbeat deadline.
    Heartbeat,
    /// Acknowledges a previously pushed message.
    Ack {
        /// The session the acknowledged push belonged to.
        session_id: u64,
        /// The message id being acknowledged.
        msg_id: u64,
    },
    /// An upstream message from the client, subject to compare-and-increment dedup.
    UpMessage {
        /// The session this message belongs to.
        session_id: u64,
        /// The client-assigned monotonic id for dedup.
        client_id: u64,
        /// Opaque upstream payload, forwarded verbatim once deduplicated.
        payload: Vec<u8>,
    },
    /// Announces that this connection is replacing an older one for the same device.
    Reconnect {
        /// The connection id being replaced.
        old_conn_id: u64,
    },
}

/// A single outstanding downstream push (§3's "last-push slot").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMsg {
    /// The session this push belongs to.
    pub session_id: u64,
    /// Monotonically-assigned (by the pusher) message id, part of the dedup lock token.
    pub msg_id: u64,
    /// Opaque payload delivered to the client verbatim.
    pub payload: Vec<u8>,
}

impl PushMsg {
    /// The token that identifies this specific outstanding push (§ GLOSSARY, `msgTimerLock`).
    pub fn timer_lock(&self) -> String {
        format!("{}_{}", self.session_id, self.msg_id)
    }
}

/// The command categories the state service may emit on the gateway command channel (§4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCommand {
    /// Close the connection and remove it from all tables.
    DelConn,
    /// Deliver a framed payload to the connection.
    Push {
        /// The opaque bytes to frame and write.
        payload: Vec<u8>,
    },
}

/// A command destined for a specific connection, as placed on the gateway command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdContext {
    /// The target connection.
    pub conn_id: u64,
    /// The command to execute against it.
    pub cmd: GatewayCommand,
}
