use std::io;

use thiserror::Error;

/// Errors surfaced by the gateway's serve-time operations (§7).
///
/// None of these are fatal to the process — they are logged at the policy-prescribed level
/// and the affected connection or submission is dropped. Startup-fatal failures (notifier
/// creation, fd-limit raise) are reported as plain `io::Error` and are expected to abort the
/// caller directly, per §7's `fatal` row.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The connection table has no handle for the given id.
    #[error("no connection with id {0}")]
    UnknownConnection(u64),

    /// The worker pool rejected a submission because it is saturated.
    #[error("worker pool saturated")]
    WorkerPoolSaturated,

    /// The global connection cap has been reached.
    #[error("connection cap of {0} reached")]
    ConnectionCapReached(u32),

    /// A codec-level failure while servicing a connection.
    #[error(transparent)]
    Codec(#[from] relay_common::CodecError),

    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}
