//! Protocol-layer configuration

use crossbar_core::options::TcpOptions;
use std::time::Duration;

/// Batching of logical messages into frames.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Flush a batch once it holds this many records. `1` disables
    /// batching: every record goes out as its own frame.
    pub max_batch: usize,

    /// Period of the background flusher that drains partial batches.
    /// The default of one hour effectively disables it.
    pub max_delay: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_batch: 1,
            max_delay: Duration::from_secs(3600),
        }
    }
}

/// Configuration of one `ProtoBus` instance.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub tcp: TcpOptions,
    pub batch: BatchOptions,

    /// Endpoint id to advertise in the greeting instead of letting peers
    /// resolve us by (address, port).
    pub greeter: Option<u64>,

    /// Resolve response promises on a dedicated thread so user callbacks
    /// never run on the I/O thread.
    pub split_executor: bool,
}
