#![deny(missing_docs, missing_debug_implementations, rust_2018_idioms, unused_imports)]

//! Per-connection state machine, durable cache, and timer/retry engine for the relay state
//! service (§4.6–§4.8).
//!
//! This crate never touches a socket. It decodes what the gateway hands it past the frame
//! boundary (via [`service::StateService::dispatch`]) and routes commands back to the owning
//! gateway through the [`sink::GatewaySink`] seam, decoupled from the transition that produced
//! them by [`outbox::Outbox`].

pub mod cache;
pub mod error;
pub mod login_slot;
pub mod outbox;
pub mod record;
pub mod router;
pub mod service;
pub mod sink;
pub mod table;
pub mod timer;
pub mod upstream;

pub use cache::{Cache, InMemoryCache, RedisCache};
pub use error::StateError;
pub use record::{ConnectionRecord, Lifecycle, OutstandingPush};
pub use router::{InMemoryRouter, Router};
pub use service::StateService;
pub use sink::{ChannelGatewaySink, GatewayRegistry, GatewaySink};
pub use table::StateTable;
pub use timer::{Entry, TimerKind, TimerWheel};
pub use upstream::{NullUpstream, Upstream};
