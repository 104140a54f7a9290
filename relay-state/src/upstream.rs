//! Upstream delivery seam (§1, §4.6's "forward upstream").
//!
//! Where a deduplicated up-message actually goes — the domain-event bus, a message broker,
//! another service — is explicitly out of scope (§1's Non-goals). [`Upstream`] is the seam
//! the up-message transition calls once dedup has succeeded.

/// Accepts deduplicated upstream payloads.
pub trait Upstream: Send + Sync {
    /// Forwards a deduplicated payload that arrived on `conn_id` within `session_id`.
    fn forward(&self, conn_id: u64, session_id: u64, payload: &[u8]);
}

/// An [`Upstream`] that only logs. Useful until a real upstream collaborator is wired in.
#[derive(Debug, Default)]
pub struct NullUpstream;

impl Upstream for NullUpstream {
    fn forward(&self, conn_id: u64, session_id: u64, payload: &[u8]) {
        log::info!(
            "upstream forward: conn={conn_id} session={session_id} payload_len={}",
            payload.len()
        );
    }
}
