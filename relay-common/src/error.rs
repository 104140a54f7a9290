use std::io;

use thiserror::Error;

/// Errors produced by the framed-TCP codec (§4.1).
#[derive(Debug, Error)]
pub enum CodecError {
    /// The peer closed the connection before a complete frame was read.
    #[error("connection closed by peer")]
    Closed,

    /// The per-read deadline elapsed before a complete frame arrived.
    #[error("read deadline elapsed")]
    Timeout,

    /// The frame's length prefix was zero or exceeded the configured maximum.
    #[error("invalid frame length: {0}")]
    Protocol(u32),

    /// Any other I/O failure, propagated as-is.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors produced by the connection-id generator (§4.2).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    /// The system clock moved backwards relative to the last id minted.
    #[error("system clock moved backwards")]
    ClockRegression,
}
