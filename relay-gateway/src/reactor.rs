//! The per-thread reactor: an epoll/IOCP readiness loop over a slab of connections (§4.3).
//!
//! Accept happens elsewhere, on blocking `std::net::TcpListener` threads (mirroring the
//! original's blocking-accept-goroutines-outside-epoll split) — this module only owns
//! already-accepted connections. A reactor never blocks servicing a connection itself: on a
//! readiness event it deregisters the socket and hands the frame read (and whatever it wakes
//! up downstream) to the worker pool, then re-arms it once the worker is done. mio's epoll
//! backend is edge-triggered (unlike the original's level-triggered `epoll_linux.go`), so that
//! re-arm must be a fresh `register` (`EPOLL_CTL_ADD`), not a `reregister` (`EPOLL_CTL_MOD`)
//! against an fd the `deregister` call already dropped — see [`connection::ConnectionHandle::rearm`].
//! New connections and connection teardowns are delivered through a waker-backed channel so
//! the poll loop only ever blocks in one place.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, warn};
use mio::{Events, Poll, Registry, Token, Waker};
use slab::Slab;

use relay_common::message::Command;

use crate::connection::ConnectionHandle;
use crate::rpc::SharedStateClient;
use crate::table::ConnTable;
use crate::worker::SharedWorkerPool;

const WAKE_TOKEN: Token = Token(usize::MAX);
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// A handle other threads use to push newly accepted connections into a running reactor.
pub struct ReactorHandle {
    sender: Sender<Arc<ConnectionHandle>>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    /// Hands a freshly accepted connection to the reactor and wakes its poll loop so it is
    /// registered without waiting out the 200ms poll timeout.
    pub fn dispatch(&self, handle: Arc<ConnectionHandle>) -> io::Result<()> {
        self.sender
            .send(handle)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reactor thread is gone"))?;
        self.waker.wake()
    }

    /// Wakes the reactor's poll loop without handing it new work — used to make it re-check
    /// the shutdown flag promptly instead of waiting out its poll timeout.
    pub fn dispatch_wake(&self) -> io::Result<()> {
        self.waker.wake()
    }

    /// A handle to the same reactor, sharing the new-connection channel and waker. Multiple
    /// accept threads hold a clone each so they can all feed the same pool of reactors.
    pub fn clone_sender(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            waker: Arc::clone(&self.waker),
        }
    }
}

impl std::fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorHandle").finish()
    }
}

/// One reactor thread's worth of state: its own `Poll` instance and its own slab of
/// connections, indexed by slab key (used directly as the `mio::Token`).
pub struct Reactor {
    id: usize,
    poll: Poll,
    registry: Registry,
    waker: Arc<Waker>,
    slab: Slab<Arc<ConnectionHandle>>,
    new_conns: Receiver<Arc<ConnectionHandle>>,
    closed_rx: Receiver<Token>,
    closed_tx: Sender<Token>,
    table: Arc<ConnTable>,
    workers: SharedWorkerPool,
    state: SharedStateClient,
    max_frame_len: u32,
    read_deadline: Duration,
    shutdown: Arc<AtomicBool>,
    shutdown_grace: Duration,
}

impl Reactor {
    /// Builds a reactor and the handle used to feed it new connections.
    pub fn new(
        id: usize,
        table: Arc<ConnTable>,
        workers: SharedWorkerPool,
        state: SharedStateClient,
        max_frame_len: u32,
        read_deadline: Duration,
        shutdown: Arc<AtomicBool>,
        shutdown_grace: Duration,
    ) -> io::Result<(Self, ReactorHandle)> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (new_tx, new_rx) = crossbeam_channel::unbounded();
        let (closed_tx, closed_rx) = crossbeam_channel::unbounded();

        let reactor = Self {
            id,
            poll,
            registry,
            waker: Arc::clone(&waker),
            slab: Slab::new(),
            new_conns: new_rx,
            closed_rx,
            closed_tx,
            table,
            workers,
            state,
            max_frame_len,
            read_deadline,
            shutdown,
            shutdown_grace,
        };
        let handle = ReactorHandle { sender: new_tx, waker };
        Ok((reactor, handle))
    }

    /// Runs the poll loop until shutdown is signalled and this reactor's slab drains empty,
    /// or until `shutdown_grace` elapses since shutdown was first observed, at which point any
    /// remaining connections are force-closed (§5).
    pub fn run(mut self) {
        let mut events = Events::with_capacity(1024);
        let mut shutdown_since: Option<std::time::Instant> = None;
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                if self.slab.is_empty() {
                    debug!("reactor {} exiting: shutdown requested and idle", self.id);
                    return;
                }
                let since = *shutdown_since.get_or_insert_with(std::time::Instant::now);
                if since.elapsed() >= self.shutdown_grace {
                    warn!(
                        "reactor {} force-closing {} connection(s) after shutdown grace elapsed",
                        self.id,
                        self.slab.len()
                    );
                    self.force_close_all();
                    return;
                }
            }
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("reactor {} poll failed: {e}", self.id);
                    return;
                }
            }
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    self.drain_new_connections();
                    self.drain_closed();
                } else {
                    self.handle_event(event.token());
                }
            }
        }
    }

    fn force_close_all(&mut self) {
        for handle in self.slab.drain() {
            if let Err(e) = handle.close() {
                warn!("reactor {} error force-closing connection {}: {e}", self.id, handle.id());
            }
            self.table.remove(handle.id());
        }
    }

    fn drain_new_connections(&mut self) {
        while let Ok(handle) = self.new_conns.try_recv() {
            let entry = self.slab.vacant_entry();
            let token = Token(entry.key());
            if let Err(e) = handle.register(&self.registry, token) {
                warn!(
                    "reactor {} failed to register connection {}: {e}",
                    self.id,
                    handle.id()
                );
                continue;
            }
            self.table.insert(Arc::clone(&handle));
            entry.insert(handle);
        }
    }

    fn drain_closed(&mut self) {
        while let Ok(token) = self.closed_rx.try_recv() {
            if self.slab.contains(token.0) {
                let handle = self.slab.remove(token.0);
                self.table.remove(handle.id());
            }
        }
    }

    fn handle_event(&mut self, token: Token) {
        let Some(handle) = self.slab.get(token.0).cloned() else {
            return;
        };
        if let Err(e) = handle.deregister(&self.registry) {
            warn!(
                "reactor {} failed to deregister connection {}: {e}",
                self.id,
                handle.id()
            );
        }

        let registry = match self.registry.try_clone() {
            Ok(r) => r,
            Err(e) => {
                error!("reactor {} failed to clone registry: {e}", self.id);
                return;
            }
        };
        let table = Arc::clone(&self.table);
        let state = Arc::clone(&self.state);
        let closed_tx = self.closed_tx.clone();
        let waker = Arc::clone(&self.waker);
        let max_frame_len = self.max_frame_len;
        let read_deadline = self.read_deadline;

        let submitted = self.workers.submit(move || {
            service_connection(
                handle,
                token,
                &registry,
                &table,
                &state,
                max_frame_len,
                read_deadline,
                &closed_tx,
                &waker,
            );
        });
        if let Err(e) = submitted {
            warn!(
                "reactor {} dropped a readiness event for token {:?}: {e}",
                self.id, token
            );
            if let Some(handle) = self.slab.get(token.0) {
                let _ = handle.register(&self.registry, token);
            }
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("id", &self.id)
            .field("connections", &self.slab.len())
            .finish()
    }
}

/// Reads exactly one frame for `handle`, dispatches the decoded command to the state client,
/// and either re-registers the socket for its next frame or tears the connection down. Runs
/// on a worker thread, never on the reactor thread.
#[allow(clippy::too_many_arguments)]
fn service_connection(
    handle: Arc<ConnectionHandle>,
    token: Token,
    registry: &Registry,
    table: &ConnTable,
    state: &dyn crate::rpc::StateClient,
    max_frame_len: u32,
    read_deadline: Duration,
    closed_tx: &Sender<Token>,
    waker: &Waker,
) {
    match handle.read_frame(max_frame_len, read_deadline) {
        Ok(frame) => match bincode::deserialize::<Command>(&frame) {
            Ok(command) => state.dispatch(handle.id(), command),
            Err(e) => warn!("connection {} sent an undecodable frame: {e}", handle.id()),
        },
        Err(e) => debug!("connection {} read error: {e}", handle.id()),
    }

    if handle.is_closed() {
        state.notify_closed(handle.id());
        table.remove(handle.id());
        let _ = closed_tx.send(token);
        let _ = waker.wake();
        return;
    }

    if let Err(e) = handle.rearm(registry, token) {
        warn!("failed to re-arm connection {}: {e}", handle.id());
        state.notify_closed(handle.id());
        table.remove(handle.id());
        let _ = closed_tx.send(token);
        let _ = waker.wake();
    }
}
