//! The in-process adapter between the gateway's [`relay_gateway::rpc::StateClient`] seam and
//! the state service's [`relay_state::StateService::dispatch`] (§6).

use std::sync::Arc;

use relay_common::message::Command;
use relay_gateway::StateClient;
use relay_state::StateService;

/// Forwards decoded commands straight into an in-process [`StateService`], tagging each call
/// with the fixed endpoint this single-process deployment registered itself under.
pub struct InProcessStateClient {
    state: Arc<StateService>,
    endpoint: &'static str,
}

impl InProcessStateClient {
    /// Wraps `state`, tagging every dispatched command with `endpoint`.
    pub fn new(state: Arc<StateService>, endpoint: &'static str) -> Self {
        Self { state, endpoint }
    }
}

impl StateClient for InProcessStateClient {
    fn dispatch(&self, conn_id: u64, command: Command) {
        self.state.dispatch(self.endpoint, conn_id, command);
    }

    fn notify_closed(&self, conn_id: u64) {
        self.state.notify_closed(conn_id);
    }
}

impl std::fmt::Debug for InProcessStateClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessStateClient")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
