//! Crossbar Core
//!
//! This crate contains the runtime building blocks of the bus:
//! - Bounded buffer pool and zero-copy shared views (`buffer`)
//! - Deadline-ordered action storage (`action_map`)
//! - Delayed / periodic executors (`executor`)
//! - One-shot future/promise and test events (`future`)
//! - Endpoint id registry (`endpoint`)
//! - Connection pool (`pool`)
//! - The readiness-driven TCP event loop (`tcp`)
//! - Error types (`error`)

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod action_map;
pub mod buffer;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod future;
pub mod options;
pub mod pool;
pub mod tcp;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::buffer::{BufferPool, ScopedBuffer, SharedView};
    pub use crate::endpoint::{EndpointId, EndpointManager};
    pub use crate::error::{BusError, Result};
    pub use crate::executor::{DelayedExecutor, Executor, PeriodicExecutor};
    pub use crate::future::{Event, Future, Promise};
    pub use crate::options::TcpOptions;
    pub use crate::tcp::{ConnHandle, TcpBus};
}
