#![deny(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! Shared wire codec, connection-id generator, and message types for the relay gateway and
//! state service.

pub mod codec;
pub mod config;
pub mod error;
pub mod id;
pub mod message;

pub use config::{GatewayConfig, StateConfig};
pub use error::{CodecError, IdError};
pub use id::ConnIdGenerator;
pub use message::{Command, CmdContext, GatewayCommand, PushMsg};
