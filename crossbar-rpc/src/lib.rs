//! Crossbar RPC
//!
//! Request/response semantics over the crossbar frame bus:
//! - Greeting handshake identifying fresh connections (`codec`)
//! - Batching envelope of request/response records (`codec`)
//! - Sequence-id correlation, per-request timeouts, promise delivery
//!   (`bus`)
//!
//! Use the `crossbar` facade crate unless you are extending the protocol
//! itself.

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod codec;
pub mod config;

pub use bus::{ProtoBus, Replier, RpcError, RpcResult};
pub use config::{BatchOptions, Options};
