//! Crossbar Error Types
//!
//! Error handling for the bus core. I/O-level failures on established
//! connections are absorbed by the event loop (close + requeue) and never
//! surface through this type; what remains is startup failures, peer
//! protocol violations and local resource limits.

use std::io;
use thiserror::Error;

/// Main error type for bus-core operations
#[derive(Error, Debug)]
pub enum BusError {
    /// IO error during socket setup or poll registration
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Peer violated the framing or envelope protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame payload exceeds the configured limit
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Send target is a transient endpoint that has not greeted yet
    #[error("Endpoint {0} is transient")]
    TransientEndpoint(u64),

    /// The event loop for this bus is already running
    #[error("Event loop already running")]
    AlreadyRunning,

    /// No handler registered for an inbound method id
    #[error("Invalid handler number: {0}")]
    InvalidHandler(u32),
}

/// Result type alias for bus-core operations
pub type Result<T> = std::result::Result<T, BusError>;

impl BusError {
    /// Create a protocol error with a message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
