//! The gateway-side connection handle (§3).

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use relay_common::codec::{read_frame, write_frame};
use relay_common::CodecError;

/// A single accepted TCP session, indexed exactly once in its owning reactor's local slab
/// (by the reactor-assigned `Token`) and exactly once in the global id→handle map (by `id`).
///
/// The slab token is assigned by the owning reactor after the handle is built (it depends on
/// the vacant slab slot), so it is not stored here — callers that register or deregister this
/// handle's interest pass the token back in, keeping the reactor's slab the single source of
/// truth for the token/handle association.
///
/// The stream is behind a `Mutex` because the reactor thread registers/deregisters it while
/// worker threads read and write frames against it; the critical sections on each side are
/// small (one syscall), so contention is not a concern.
pub struct ConnectionHandle {
    id: u64,
    remote_addr: SocketAddr,
    stream: Mutex<TcpStream>,
    closed: AtomicBool,
}

impl ConnectionHandle {
    /// Wraps an accepted stream with its assigned connection id.
    pub fn new(id: u64, remote_addr: SocketAddr, stream: TcpStream) -> Self {
        Self {
            id,
            remote_addr,
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
        }
    }

    /// The globally-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The peer's socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Whether this handle has observed a terminal condition (EOF, protocol error, or an
    /// explicit close command) and should be torn down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Registers the underlying socket with `registry` under `token`, for readability and
    /// hangup (§4.3).
    pub fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        self.stream
            .lock()
            .unwrap()
            .register(registry, token, Interest::READABLE)
    }

    /// Re-arms interest after a per-frame handler has drained the socket, so its next frame
    /// wakes the reactor again. mio's epoll backend is edge-triggered, and the handler's
    /// `deregister` (`EPOLL_CTL_DEL`) already dropped this fd from the interest list, so the
    /// re-arm must `register` (`EPOLL_CTL_ADD`) again rather than `reregister`
    /// (`EPOLL_CTL_MOD`), which would fail with `ENOENT` against an fd that isn't registered.
    pub fn rearm(&self, registry: &Registry, token: Token) -> io::Result<()> {
        self.stream
            .lock()
            .unwrap()
            .register(registry, token, Interest::READABLE)
    }

    /// Deregisters the underlying socket from `registry`.
    pub fn deregister(&self, registry: &Registry) -> io::Result<()> {
        self.stream.lock().unwrap().deregister(registry)
    }

    /// Reads one complete frame from the socket, per §4.1.
    ///
    /// On `Closed` or `Protocol`, the handle is marked closed so the caller can tear it down.
    pub fn read_frame(&self, max_frame_len: u32, deadline: Duration) -> Result<Vec<u8>, CodecError> {
        let mut stream = self.stream.lock().unwrap();
        let result = read_frame(&mut *stream, max_frame_len, deadline);
        if matches!(result, Err(CodecError::Closed) | Err(CodecError::Protocol(_))) {
            drop(stream);
            self.mark_closed();
        }
        result
    }

    /// Frames and writes `payload` to the socket.
    pub fn write_frame(&self, payload: &[u8]) -> Result<(), CodecError> {
        let mut stream = self.stream.lock().unwrap();
        let result = write_frame(&mut *stream, payload);
        if result.is_err() {
            drop(stream);
            self.mark_closed();
        }
        result
    }

    /// Shuts the socket down and marks the handle closed. Idempotent.
    pub fn close(&self) -> io::Result<()> {
        self.mark_closed();
        match self.stream.lock().unwrap().shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Already shut down / not connected — treat as success, matching the §4.6
            // requirement that `DelConn` be idempotent.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
