//! Wires accept threads, reactors, the worker pool, and the command dispatcher into a single
//! running gateway process (§4.3, §5).

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};
use mio::net::TcpStream as MioTcpStream;
use relay_common::message::CmdContext;
use relay_common::{ConnIdGenerator, GatewayConfig};
use socket2::{SockRef, TcpKeepalive};

use crate::command::{CommandDispatcher, CommandMetrics};
use crate::connection::ConnectionHandle;
use crate::reactor::{Reactor, ReactorHandle};
use crate::rpc::SharedStateClient;
use crate::table::ConnTable;
use crate::worker::WorkerPool;

/// Raises the process's open-file-descriptor soft limit to at least `want`, best-effort,
/// mirroring the original's `setLimit` startup step. Failures are logged, not fatal: a
/// conservative limit just means the connection cap in `GatewayConfig::max_tcp` is reached
/// sooner.
fn raise_fd_limit(want: u64) {
    // SAFETY: `rlimit` is a plain-old-data struct and `getrlimit`/`setrlimit` are standard
    // POSIX calls operating on the current process's own limits.
    unsafe {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) != 0 {
            warn!("getrlimit(RLIMIT_NOFILE) failed: {}", io::Error::last_os_error());
            return;
        }
        let target = want.min(limit.rlim_max);
        if limit.rlim_cur >= target {
            return;
        }
        limit.rlim_cur = target;
        if libc::setrlimit(libc::RLIMIT_NOFILE, &limit) != 0 {
            warn!("setrlimit(RLIMIT_NOFILE, {target}) failed: {}", io::Error::last_os_error());
        } else {
            info!("raised RLIMIT_NOFILE soft limit to {target}");
        }
    }
}

/// A fully running gateway: accept threads, a pool of reactors, the off-reactor worker pool,
/// and the command dispatcher that applies state-service commands to live connections.
pub struct GatewayRuntime {
    table: Arc<ConnTable>,
    listen_addr: SocketAddr,
    reactor_handles: Vec<ReactorHandle>,
    reactor_threads: Vec<JoinHandle<()>>,
    accept_threads: Vec<JoinHandle<()>>,
    command_dispatcher: CommandDispatcher,
    shutdown: Arc<AtomicBool>,
}

impl GatewayRuntime {
    /// Binds `addr` and starts every thread the gateway needs: accept threads, reactors, the
    /// worker pool, and the command dispatcher.
    pub fn start(addr: SocketAddr, config: &GatewayConfig, state: SharedStateClient) -> io::Result<Self> {
        raise_fd_limit(u64::from(config.max_tcp) + 1024);

        let shutdown = Arc::new(AtomicBool::new(false));
        let table = Arc::new(ConnTable::new());
        let workers = Arc::new(WorkerPool::new(config.worker_pool_size, config.wait_queue_size));
        let command_dispatcher = CommandDispatcher::spawn(Arc::clone(&table), config.command_channel_size);

        let mut reactor_handles = Vec::with_capacity(config.reactor_count);
        let mut reactor_threads = Vec::with_capacity(config.reactor_count);
        for id in 0..config.reactor_count {
            let (reactor, handle) = Reactor::new(
                id,
                Arc::clone(&table),
                Arc::clone(&workers),
                Arc::clone(&state),
                config.max_frame_len,
                config.read_deadline,
                Arc::clone(&shutdown),
                config.shutdown_grace,
            )?;
            let thread_handle = thread::Builder::new()
                .name(format!("relay-reactor-{id}"))
                .spawn(move || reactor.run())
                .expect("failed to spawn reactor thread");
            reactor_handles.push(handle);
            reactor_threads.push(thread_handle);
        }

        let listener = StdTcpListener::bind(addr)?;
        let listen_addr = listener.local_addr()?;
        let id_gen = Arc::new(ConnIdGenerator::new());
        let accept_threads = (0..num_cpus::get())
            .map(|idx| {
                let listener = listener.try_clone().expect("failed to clone listener socket");
                let id_gen = Arc::clone(&id_gen);
                let table = Arc::clone(&table);
                let shutdown = Arc::clone(&shutdown);
                let reactor_handles = clone_reactor_targets(&reactor_handles);
                let max_tcp = config.max_tcp;
                thread::Builder::new()
                    .name(format!("relay-accept-{idx}"))
                    .spawn(move || accept_loop(listener, id_gen, table, reactor_handles, max_tcp, shutdown))
                    .expect("failed to spawn accept thread")
            })
            .collect();

        Ok(Self {
            table,
            listen_addr,
            reactor_handles,
            reactor_threads,
            accept_threads,
            command_dispatcher,
            shutdown,
        })
    }

    /// The address this gateway ended up bound to (useful when `start` was called with an
    /// ephemeral `:0` port).
    pub fn local_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// A sender other components (e.g. an in-process RPC server stub) use to enqueue gateway
    /// commands from the state service.
    pub fn command_sender(&self) -> crossbeam_channel::Sender<CmdContext> {
        self.command_dispatcher.sender()
    }

    /// Metrics for the command dispatcher.
    pub fn command_metrics(&self) -> Arc<CommandMetrics> {
        self.command_dispatcher.metrics()
    }

    /// Number of connections currently tracked across every reactor.
    pub fn connection_count(&self) -> usize {
        self.table.len()
    }

    /// Signals shutdown: accept threads stop taking new connections and reactors drain and
    /// exit once idle. Does not block; call `join` after to wait for full drain.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in &self.reactor_handles {
            // Wake every reactor so it re-checks the shutdown flag promptly instead of
            // waiting out its poll timeout.
            let _ = handle.dispatch_wake();
        }
    }

    /// Joins every thread. Intended to be called after `request_shutdown` and, ideally, after
    /// a bounded grace period (`GatewayConfig::shutdown_grace`) has elapsed.
    pub fn join(self) {
        for handle in self.accept_threads {
            let _ = handle.join();
        }
        for handle in self.reactor_threads {
            let _ = handle.join();
        }
        self.command_dispatcher.shutdown();
    }
}

impl std::fmt::Debug for GatewayRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayRuntime")
            .field("connections", &self.table.len())
            .field("reactors", &self.reactor_threads.len())
            .finish()
    }
}

fn clone_reactor_targets(handles: &[ReactorHandle]) -> Vec<ReactorHandle> {
    handles.iter().map(ReactorHandle::clone_sender).collect()
}

fn accept_loop(
    listener: StdTcpListener,
    id_gen: Arc<ConnIdGenerator>,
    table: Arc<ConnTable>,
    reactor_handles: Vec<ReactorHandle>,
    max_tcp: u32,
    shutdown: Arc<AtomicBool>,
) {
    // A genuinely blocking `accept()` (as the original's accept goroutines use) can't be
    // woken up for shutdown without also closing the shared listener out from under sibling
    // accept threads. Polling non-blocking with a short sleep keeps the "accept lives outside
    // epoll, on its own threads" structure while staying responsive to `shutdown`.
    if let Err(e) = listener.set_nonblocking(true) {
        error!("failed to set accept listener non-blocking: {e}");
        return;
    }
    let mut next_reactor = 0usize;
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        let (stream, remote_addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        if table.len() >= max_tcp as usize {
            warn!("connection cap of {max_tcp} reached, rejecting {remote_addr}");
            drop(stream);
            continue;
        }
        if let Err(e) = configure_socket(&stream) {
            warn!("failed to configure accepted socket from {remote_addr}: {e}");
        }
        if let Err(e) = stream.set_nonblocking(true) {
            warn!("failed to set non-blocking on socket from {remote_addr}: {e}");
            continue;
        }

        let conn_id = match id_gen.next_id() {
            Ok(id) => id,
            Err(e) => {
                error!("connection id generation failed, dropping {remote_addr}: {e}");
                continue;
            }
        };
        let mio_stream = MioTcpStream::from_std(stream);
        let handle = Arc::new(ConnectionHandle::new(conn_id, remote_addr, mio_stream));

        let reactor = &reactor_handles[next_reactor % reactor_handles.len()];
        next_reactor = next_reactor.wrapping_add(1);
        if let Err(e) = reactor.dispatch(handle) {
            error!("failed to hand connection {conn_id} to a reactor: {e}");
        }
    }
}

fn configure_socket(stream: &std::net::TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let sock_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(15));
    sock_ref.set_tcp_keepalive(&keepalive)
}
