use thiserror::Error;

/// Errors surfaced by the state service's serve-time operations (§7).
///
/// `Cache` failures during login are `persistent-cache` per §7: the caller fails the login
/// and the client retries. A `Cache` failure during recovery is startup-fatal and is expected
/// to abort the process rather than come through this type (§4.8, §7's `fatal` row).
#[derive(Debug, Error)]
pub enum StateError {
    /// No record exists for the given connection id.
    #[error("no state record for connection {0}")]
    UnknownConnection(u64),

    /// A persisted login-slot entry did not parse as `"<device_id>|<conn_id>"`.
    #[error("malformed login-slot entry: {0:?}")]
    MalformedLoginSlotEntry(String),

    /// The durable cache rejected or failed an operation.
    #[error("cache operation failed: {0}")]
    Cache(#[from] redis::RedisError),

    /// A persisted value failed to (de)serialize.
    #[error("failed to (de)serialize a persisted value: {0}")]
    Codec(#[from] bincode::Error),
}
