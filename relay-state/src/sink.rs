//! The state→gateway command seam (§4.5, §6).
//!
//! The state service never touches a socket directly; it hands `(conn_id, GatewayCommand)`
//! pairs to whichever gateway process owns that connection, addressed by `endpoint`
//! (`"<ip>:<port>"`, §6). [`GatewaySink`] is that seam — an in-process deployment wires it
//! directly onto the gateway's command-channel sender (`CommandDispatcher::sender`); a
//! networked deployment would wire it onto an RPC client instead, which is out of scope here.
//! [`GatewayRegistry`] tracks one sink per live endpoint so a push or cancel can be routed to
//! the right gateway in a multi-process fleet.

use std::sync::Arc;

use dashmap::DashMap;
use log::warn;

use relay_common::message::{CmdContext, GatewayCommand};

/// Delivers a single command to the gateway that owns `conn_id`.
pub trait GatewaySink: Send + Sync {
    /// Hands `cmd` to the gateway for `conn_id`. Per §5, the gateway command channel is
    /// bounded and producers block on a full channel rather than drop — callers should not
    /// invoke this while holding a per-connection lock they don't want contended.
    fn send(&self, conn_id: u64, cmd: GatewayCommand);
}

/// A [`GatewaySink`] backed by a `crossbeam_channel` sender, the shape
/// `relay_gateway::CommandDispatcher` exposes for its command channel.
#[derive(Debug, Clone)]
pub struct ChannelGatewaySink {
    sender: crossbeam_channel::Sender<CmdContext>,
}

impl ChannelGatewaySink {
    /// Wraps a gateway's command-channel sender.
    pub fn new(sender: crossbeam_channel::Sender<CmdContext>) -> Self {
        Self { sender }
    }
}

impl GatewaySink for ChannelGatewaySink {
    fn send(&self, conn_id: u64, cmd: GatewayCommand) {
        if self.sender.send(CmdContext { conn_id, cmd }).is_err() {
            warn!("gateway command channel for connection {conn_id} is gone; dropping command");
        }
    }
}

/// Tracks the [`GatewaySink`] for every gateway endpoint currently known to this process, so
/// outbound commands can be routed to the endpoint that owns a given connection (§6).
#[derive(Debug, Default)]
pub struct GatewayRegistry {
    sinks: DashMap<String, Arc<dyn GatewaySink>>,
}

impl GatewayRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the sink for `endpoint`.
    pub fn register(&self, endpoint: impl Into<String>, sink: Arc<dyn GatewaySink>) {
        self.sinks.insert(endpoint.into(), sink);
    }

    /// Removes the sink for `endpoint`, if present.
    pub fn unregister(&self, endpoint: &str) {
        self.sinks.remove(endpoint);
    }

    /// Routes `cmd` to the sink registered for `endpoint`. Logs and drops the command if no
    /// sink is registered — this happens for connections recovered by crash recovery (§4.8)
    /// whose owning gateway is not yet known, or for an endpoint that has since gone away,
    /// which is never fatal (§7).
    pub fn send(&self, endpoint: &str, conn_id: u64, cmd: GatewayCommand) {
        match self.sinks.get(endpoint) {
            Some(sink) => sink.send(conn_id, cmd),
            None => warn!("no gateway sink registered for endpoint {endpoint}; dropping command for connection {conn_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<(u64, GatewayCommand)>>,
    }

    impl GatewaySink for RecordingSink {
        fn send(&self, conn_id: u64, cmd: GatewayCommand) {
            self.received.lock().unwrap().push((conn_id, cmd));
        }
    }

    #[test]
    fn routes_to_the_registered_endpoint() {
        let registry = GatewayRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        registry.register("gw-a:9000", sink.clone());

        registry.send("gw-a:9000", 42, GatewayCommand::DelConn);

        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, 42);
    }

    #[test]
    fn unregistered_endpoint_drops_silently() {
        let registry = GatewayRegistry::new();
        // No sink registered; this must not panic.
        registry.send("ghost:9000", 1, GatewayCommand::DelConn);
    }

    #[test]
    fn unregister_stops_routing() {
        let registry = GatewayRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        registry.register("gw-a:9000", sink.clone());
        registry.unregister("gw-a:9000");

        registry.send("gw-a:9000", 1, GatewayCommand::DelConn);
        assert!(sink.received.lock().unwrap().is_empty());
    }
}
