//! The gateway command channel dispatcher (§4.5).
//!
//! The state service pushes `CmdContext` values (close this connection / deliver this frame)
//! onto a bounded channel; this module drains it on a dedicated thread and applies each
//! command against the connection table. Unknown commands cannot occur (`GatewayCommand` is a
//! closed enum matched exhaustively), so the "reject with a log plus a counter rather than a
//! panic" policy from §4.5 applies only at the channel-send boundary, which lives outside this
//! crate — here every command is by construction one this gateway understands.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{debug, warn};

use relay_common::message::{CmdContext, GatewayCommand};

use crate::table::ConnTable;

/// Running counters exposed for observability of the command channel's health.
#[derive(Debug, Default)]
pub struct CommandMetrics {
    /// Commands successfully applied.
    pub applied: AtomicU64,
    /// Commands dropped because their target connection no longer exists.
    pub unknown_connection: AtomicU64,
}

/// Drains the gateway command channel on its own thread and applies each command to the
/// shared connection table.
///
/// The sender is kept behind an `Option` rather than held bare: both `shutdown` and `Drop`
/// need to actually drop it (not merely a clone) before joining the dispatcher thread, since
/// `recv()` only returns `Err` once every sender — including this struct's own — is gone.
pub struct CommandDispatcher {
    sender: Option<Sender<CmdContext>>,
    handle: Option<JoinHandle<()>>,
    metrics: Arc<CommandMetrics>,
}

impl CommandDispatcher {
    /// Spawns the dispatcher thread, bounding the channel at `queue_len` per §4.5.
    pub fn spawn(table: Arc<ConnTable>, queue_len: usize) -> Self {
        let (sender, receiver): (Sender<CmdContext>, Receiver<CmdContext>) =
            crossbeam_channel::bounded(queue_len);
        let metrics = Arc::new(CommandMetrics::default());
        let worker_metrics = Arc::clone(&metrics);
        let handle = thread::Builder::new()
            .name("relay-command-dispatcher".into())
            .spawn(move || Self::run(receiver, table, worker_metrics))
            .expect("failed to spawn command dispatcher thread");
        Self {
            sender: Some(sender),
            handle: Some(handle),
            metrics,
        }
    }

    fn run(receiver: Receiver<CmdContext>, table: Arc<ConnTable>, metrics: Arc<CommandMetrics>) {
        while let Ok(ctx) = receiver.recv() {
            Self::apply(&table, &metrics, ctx);
        }
        debug!("command dispatcher shutting down: channel closed");
    }

    fn apply(table: &ConnTable, metrics: &CommandMetrics, ctx: CmdContext) {
        let Some(handle) = table.get(ctx.conn_id) else {
            warn!("command for unknown connection {}: {:?}", ctx.conn_id, ctx.cmd);
            metrics.unknown_connection.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match ctx.cmd {
            GatewayCommand::DelConn => {
                if let Err(e) = handle.close() {
                    warn!("error closing connection {} on DelConn: {e}", ctx.conn_id);
                }
                table.remove(ctx.conn_id);
            }
            GatewayCommand::Push { payload } => {
                if let Err(e) = handle.write_frame(&payload) {
                    warn!("error pushing frame to connection {}: {e}", ctx.conn_id);
                    table.remove(ctx.conn_id);
                }
            }
        }
        metrics.applied.fetch_add(1, Ordering::Relaxed);
    }

    /// A cloneable handle callers (e.g. an RPC server stub) use to enqueue commands.
    ///
    /// Panics if called after `shutdown` — the dispatcher is not meant to be resurrected once
    /// stopped.
    pub fn sender(&self) -> Sender<CmdContext> {
        self.sender.as_ref().expect("dispatcher already shut down").clone()
    }

    /// Snapshot of the dispatcher's running metrics.
    pub fn metrics(&self) -> Arc<CommandMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Submits a command, failing fast if the channel is saturated rather than blocking the
    /// submitter (mirrors the worker pool's non-blocking submission policy).
    pub fn try_submit(&self, ctx: CmdContext) -> Result<(), CmdContext> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(ctx);
        };
        match sender.try_send(ctx) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(ctx)) => Err(ctx),
            Err(TrySendError::Disconnected(ctx)) => Err(ctx),
        }
    }

    /// Closes the channel and joins the dispatcher thread, draining whatever is already
    /// queued before returning (§4.5's shutdown drain-then-close order).
    pub fn shutdown(mut self) {
        self.close_and_join();
    }

    fn close_and_join(&mut self) {
        // Drop the sender itself (not a clone) before joining — `recv()` only returns `Err`
        // once every sender, including this one, is gone, so joining first would hang.
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.close_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener as MioTcpListener;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn connected_handle(id: u64) -> Arc<crate::connection::ConnectionHandle> {
        let listener = MioTcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let stream = mio::net::TcpStream::from_std(client);
        Arc::new(crate::connection::ConnectionHandle::new(
            id,
            stream.peer_addr().unwrap(),
            stream,
        ))
    }

    #[test]
    fn unknown_connection_is_counted_not_panicked() {
        let table = Arc::new(ConnTable::new());
        let dispatcher = CommandDispatcher::spawn(Arc::clone(&table), 8);
        dispatcher
            .try_submit(CmdContext {
                conn_id: 99,
                cmd: GatewayCommand::DelConn,
            })
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(dispatcher.metrics().unknown_connection.load(Ordering::Relaxed), 1);
        dispatcher.shutdown();
    }

    #[test]
    fn del_conn_removes_from_table() {
        let table = Arc::new(ConnTable::new());
        table.insert(connected_handle(1));
        let dispatcher = CommandDispatcher::spawn(Arc::clone(&table), 8);
        dispatcher
            .try_submit(CmdContext {
                conn_id: 1,
                cmd: GatewayCommand::DelConn,
            })
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(table.get(1).is_none());
        dispatcher.shutdown();
    }
}
