#![deny(missing_docs, missing_debug_implementations, rust_2018_idioms, unused_imports)]

//! Reactor pool, worker pool, and connection tables for the relay TCP gateway (§4.3–§4.5).
//!
//! This crate owns sockets and framing only. Decoding client commands past the frame
//! boundary, and deciding what to do with them, is the state service's job, reached through
//! the [`rpc::StateClient`] seam. Pushes and connection teardowns flow back the other way
//! through [`command::CommandDispatcher`].

pub mod command;
pub mod connection;
pub mod error;
pub mod pool;
pub mod reactor;
pub mod rpc;
pub mod table;
pub mod worker;

pub use command::CommandDispatcher;
pub use connection::ConnectionHandle;
pub use error::GatewayError;
pub use pool::GatewayRuntime;
pub use rpc::{NullStateClient, StateClient};
pub use table::ConnTable;
pub use worker::WorkerPool;
