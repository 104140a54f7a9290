//! Decouples state transitions from the gateway command channel's blocking send (§4.5, §5).
//!
//! §5 specifies that the gateway command channel blocks producers when full. A transition
//! method on [`crate::service::StateService`] runs with a per-connection record lock held
//! (`StateTable::with_record`); blocking that call on a slow or saturated gateway sink would
//! hold the lock far longer than the single-conn_id critical section §5 calls for. The outbox
//! is the same shape as the gateway's own `CommandDispatcher` (§4.5): transitions enqueue
//! `(endpoint, conn_id, GatewayCommand)` onto a bounded channel sized by
//! `StateConfig::command_channel_size` without blocking, and a dedicated thread drains it and
//! performs the (possibly blocking) send into the right gateway's sink.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::warn;

use relay_common::message::GatewayCommand;

use crate::sink::GatewayRegistry;

struct OutboundCommand {
    endpoint: String,
    conn_id: u64,
    cmd: GatewayCommand,
}

/// A bounded queue of outbound gateway commands, drained by one dedicated thread.
///
/// The sender is kept behind an `Option`: both `shutdown` and `Drop` need to actually drop it
/// (not merely a clone) before joining the draining thread, since its `recv()` only returns
/// `Err` once every sender — including this struct's own — is gone.
pub struct Outbox {
    sender: Option<Sender<OutboundCommand>>,
    handle: Option<JoinHandle<()>>,
}

impl Outbox {
    /// Spawns the draining thread, bounding the queue at `queue_len`.
    pub fn spawn(gateways: std::sync::Arc<GatewayRegistry>, queue_len: usize) -> Self {
        let (sender, receiver): (Sender<OutboundCommand>, Receiver<OutboundCommand>) =
            crossbeam_channel::bounded(queue_len);
        let handle = thread::Builder::new()
            .name("relay-state-outbox".into())
            .spawn(move || {
                while let Ok(cmd) = receiver.recv() {
                    gateways.send(&cmd.endpoint, cmd.conn_id, cmd.cmd);
                }
            })
            .expect("failed to spawn state outbox thread");
        Self {
            sender: Some(sender),
            handle: Some(handle),
        }
    }

    /// Enqueues a command for `conn_id`, owned by `endpoint`, without blocking. On saturation
    /// the command is dropped and logged per §7's saturation policy; the retry/ack engine and
    /// the client's own reconnect-and-relogin behavior both backstop a dropped `Push`, and a
    /// dropped `DelConn` is harmless because it is idempotent (§4.6).
    pub fn submit(&self, endpoint: String, conn_id: u64, cmd: GatewayCommand) {
        let Some(sender) = self.sender.as_ref() else {
            warn!("state outbox already shut down; dropping a command for connection {conn_id}");
            return;
        };
        let outbound = OutboundCommand { endpoint, conn_id, cmd };
        if let Err(TrySendError::Full(_)) = sender.try_send(outbound) {
            warn!("state outbox saturated; dropping a command for connection {conn_id}");
        }
    }

    /// Drops the sender and joins the draining thread, letting it finish whatever is already
    /// queued.
    pub fn shutdown(mut self) {
        self.close_and_join();
    }

    fn close_and_join(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Outbox {
    fn drop(&mut self) {
        self.close_and_join();
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{ChannelGatewaySink, GatewayRegistry};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn submitted_commands_reach_the_registered_gateway() {
        let registry = Arc::new(GatewayRegistry::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        registry.register("gw-a:9000", Arc::new(ChannelGatewaySink::new(tx)));

        let outbox = Outbox::spawn(Arc::clone(&registry), 16);
        outbox.submit("gw-a:9000".to_string(), 42, GatewayCommand::DelConn);

        let ctx = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(ctx.conn_id, 42);
        assert_eq!(ctx.cmd, GatewayCommand::DelConn);

        outbox.shutdown();
    }
}
