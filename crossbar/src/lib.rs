//! # Crossbar
//!
//! A point-to-point message bus delivering length-prefixed binary
//! payloads between peers over persistent TCP connections, with
//! request/response semantics layered on top.
//!
//! ## Architecture
//!
//! Crossbar is structured as a small messaging kernel with clean layering:
//!
//! - **`crossbar-core`**: buffer pool and zero-copy views, timers, the
//!   connection pool and the readiness-driven TCP event loop
//! - **`crossbar-rpc`**: greeting handshake, batching envelope,
//!   sequence-id correlation and per-request timeouts
//! - **`crossbar`**: public API surface (this crate)
//!
//! One I/O thread per bus multiplexes every connection; a fixed fan-out
//! of sockets is kept per peer and transient failures are absorbed by
//! closing, requeueing and reconnecting. Requests resolve exactly once:
//! with the correlated response, with `"timeout exceeded"`, or with
//! `"too many pending messages"`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use crossbar::{EndpointManager, Options, ProtoBus, TcpOptions};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> crossbar::Result<()> {
//!     // Echo server on port 4001.
//!     let server = ProtoBus::new(
//!         Options {
//!             tcp: TcpOptions {
//!                 port: 4001,
//!                 ..TcpOptions::default()
//!             },
//!             ..Options::default()
//!         },
//!         Arc::new(EndpointManager::new()),
//!     )?;
//!     server.register_handler(1, |_endpoint, data, replier| {
//!         replier.reply(Bytes::copy_from_slice(data.as_slice()));
//!     });
//!     server.start()?;
//!
//!     // Client.
//!     let client = ProtoBus::new(Options::default(), Arc::new(EndpointManager::new()))?;
//!     client.start()?;
//!     let target = client.endpoints().register("127.0.0.1:4001".parse().unwrap());
//!     let reply = client
//!         .request(target, 1, Bytes::from_static(b"ping"), Duration::from_secs(4))
//!         .wait();
//!     assert_eq!(reply.unwrap().as_slice(), b"ping");
//!     Ok(())
//! }
//! ```
//!
//! ## Performance
//!
//! - **Zero-copy**: payloads travel as refcounted views over pooled
//!   buffers, from the wire to the handler
//! - **Edge-triggered readiness**: every ready connection is drained
//!   until it would block; no per-frame syscall overhead beyond the reads
//! - **Batching**: many logical messages amortize one frame and one write

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub use crossbar_core::buffer::{BufferPool, ScopedBuffer, SharedView};
pub use crossbar_core::endpoint::{EndpointId, EndpointManager};
pub use crossbar_core::error::{BusError, Result};
pub use crossbar_core::executor::{DelayedExecutor, Executor, PeriodicExecutor};
pub use crossbar_core::future::{Event, Future, Promise};
pub use crossbar_core::options::TcpOptions;
pub use crossbar_core::tcp::{ConnHandle, TcpBus};
pub use crossbar_rpc::{BatchOptions, Options, ProtoBus, Replier, RpcError, RpcResult};

/// Re-exported for payload construction.
pub use bytes;
