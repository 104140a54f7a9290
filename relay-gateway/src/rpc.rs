//! The gateway→state RPC seam (§6).
//!
//! The wire transport of this call is out of scope here (§1 treats gRPC, or any other
//! networked RPC, as an external collaborator). What the gateway needs from it is narrow: hand
//! a decoded frame for a connection to whatever is running the state machine, without caring
//! whether that happens in-process, over a Unix socket, or over the network. `StateClient` is
//! that seam. This crate ships only [`NullStateClient`], a drop-in placeholder for tests that
//! don't care about state-service behavior; the binary that assembles a full deployment wires
//! an in-process adapter onto `relay_state::StateService` directly, since that adapter needs
//! to depend on both crates.

use std::sync::Arc;

use log::warn;

use relay_common::message::Command;

/// Everything the gateway needs from the state service, reached from worker threads.
///
/// Implementations must be cheap to call concurrently from many worker threads at once;
/// `dispatch` is fire-and-forget from the gateway's point of view — responses and pushes
/// arrive later on the gateway command channel (§4.5), not as a return value here.
pub trait StateClient: Send + Sync {
    /// Hands a decoded command from `conn_id` to the state service.
    fn dispatch(&self, conn_id: u64, command: Command);

    /// Informs the state service that `conn_id` has been torn down locally, so it can clear
    /// any state keyed on it without waiting for a heartbeat timeout.
    fn notify_closed(&self, conn_id: u64);
}

/// A `StateClient` that logs and drops everything. Useful as a placeholder until a real
/// state-service link (in-process or otherwise) is wired in, and in tests that only care
/// about gateway-side behavior.
#[derive(Debug, Default)]
pub struct NullStateClient;

impl StateClient for NullStateClient {
    fn dispatch(&self, conn_id: u64, command: Command) {
        warn!("no state client configured; dropping command from connection {conn_id}: {command:?}");
    }

    fn notify_closed(&self, conn_id: u64) {
        warn!("no state client configured; dropping close notification for connection {conn_id}");
    }
}

/// Type alias for the trait object form callers pass around.
pub type SharedStateClient = Arc<dyn StateClient>;
