//! The request/response bus
//!
//! Layered on the frame bus: a fresh connection greets first (announcing
//! the listen port, or a forced endpoint id), after which every frame
//! carries a batch of request/response records. Requests correlate with
//! responses by a per-bus sequence id; every pending request resolves
//! exactly once — by its response, by its timeout, or by a failed send.

use crate::codec::{self, Greeting, Message, MessageKind};
use crate::config::Options;
use bytes::Bytes;
use crossbar_core::buffer::{BufferPool, SharedView};
use crossbar_core::endpoint::{EndpointId, EndpointManager};
use crossbar_core::error::{BusError, Result};
use crossbar_core::executor::{DelayedExecutor, Executor, PeriodicExecutor};
use crossbar_core::future::{Future, Promise};
use crossbar_core::tcp::{ConnHandle, TcpBus};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Failures a request future can resolve with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("timeout exceeded")]
    TimeoutExceeded,

    #[error("too many pending messages")]
    TooManyPending,
}

/// What a request future resolves to: the peer's response payload or a
/// request-level failure.
pub type RpcResult = std::result::Result<SharedView, RpcError>;

type RawHandler = Arc<dyn Fn(EndpointId, u64, SharedView) + Send + Sync>;

/// One-shot responder handed to request handlers.
///
/// Consuming it with [`Replier::reply`] sends the response record back to
/// the originating endpoint under the request's sequence id. Replying may
/// happen after the handler returned (deferred responses).
pub struct Replier {
    inner: Weak<Inner>,
    endpoint: EndpointId,
    seq_id: u64,
    method: u32,
}

impl Replier {
    pub fn reply(self, data: Bytes) {
        let Some(inner) = self.inner.upgrade() else {
            trace!("reply after bus shutdown; dropped");
            return;
        };
        inner.send_item(
            self.endpoint,
            Message {
                seq_id: self.seq_id,
                kind: MessageKind::Response,
                method: self.method,
                data: SharedView::from_bytes(data),
            },
        );
    }
}

struct Inner {
    bus: Arc<TcpBus>,
    endpoints: Arc<EndpointManager>,
    buffers: BufferPool,
    exec: Arc<dyn Executor>,
    split: bool,
    handlers: RwLock<Vec<Option<RawHandler>>>,
    accumulated: Mutex<HashMap<EndpointId, Vec<Message>>>,
    sent_requests: Mutex<HashMap<u64, Promise<RpcResult>>>,
    seq_id: AtomicU64,
    max_batch: usize,
}

/// The request/response bus instance.
///
/// Register handlers, call [`ProtoBus::start`], then issue requests from
/// any thread. Dropping the bus stops the event loop and joins the I/O
/// thread.
pub struct ProtoBus {
    inner: Arc<Inner>,
    flusher: PeriodicExecutor,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ProtoBus {
    /// Bind and wire up a bus; startup failures propagate.
    pub fn new(opts: Options, endpoints: Arc<EndpointManager>) -> Result<Self> {
        let buffers = BufferPool::with_capacity(opts.tcp.slab_size(), opts.tcp.pool_slabs);
        let bus = Arc::new(TcpBus::new(
            opts.tcp.clone(),
            buffers.clone(),
            Arc::clone(&endpoints),
        )?);
        let exec: Arc<dyn Executor> = if opts.split_executor {
            Arc::new(DelayedExecutor::new()?)
        } else {
            Arc::clone(&bus) as Arc<dyn Executor>
        };

        let inner = Arc::new(Inner {
            bus: Arc::clone(&bus),
            endpoints,
            buffers: buffers.clone(),
            exec,
            split: opts.split_executor,
            handlers: RwLock::new(Vec::new()),
            accumulated: Mutex::new(HashMap::new()),
            sent_requests: Mutex::new(HashMap::new()),
            seq_id: AtomicU64::new(0),
            max_batch: opts.batch.max_batch.max(1),
        });

        // Announce the port the listener actually bound, so `port: 0`
        // configurations stay resolvable.
        let greeting = Greeting {
            port: bus.local_addr().port(),
            endpoint_id: opts.greeter,
        };
        bus.set_greeter(Box::new(move |_endpoint| {
            let mut buf = buffers.acquire();
            let len = greeting.encoded_len();
            {
                let mut dst: &mut [u8] = buf.as_mut();
                greeting.encode_into(&mut dst);
            }
            buf.freeze(len)
        }));

        let handler_inner = Arc::downgrade(&inner);
        bus.set_handler(Box::new(move |handle, view| {
            if let Some(inner) = handler_inner.upgrade() {
                inner.handle(handle, view);
            }
        }));

        let flusher_inner = Arc::downgrade(&inner);
        let flusher = PeriodicExecutor::new(
            move || {
                if let Some(inner) = flusher_inner.upgrade() {
                    inner.timed_flush();
                }
            },
            opts.batch.max_delay,
            Arc::clone(&bus) as Arc<dyn Executor>,
        );

        Ok(Self {
            inner,
            flusher,
            io_thread: Mutex::new(None),
        })
    }

    /// Spawn the I/O thread and arm the periodic flusher.
    pub fn start(&self) -> Result<()> {
        let bus = Arc::clone(&self.inner.bus);
        let io = std::thread::Builder::new()
            .name("crossbar-io".into())
            .spawn(move || {
                if let Err(err) = bus.run() {
                    error!(%err, "event loop terminated");
                }
            })
            .map_err(BusError::from)?;
        *self.io_thread.lock() = Some(io);
        self.flusher.delayed_start();
        Ok(())
    }

    /// Address the underlying listener bound.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.bus.local_addr()
    }

    #[must_use]
    pub fn endpoints(&self) -> &Arc<EndpointManager> {
        &self.inner.endpoints
    }

    /// The executor timeouts and deferred work run on.
    #[must_use]
    pub fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.inner.exec)
    }

    /// Install the handler for `method`.
    ///
    /// Handlers run on the I/O thread and must not block; long work goes
    /// to another executor, replying later through the [`Replier`].
    pub fn register_handler(
        &self,
        method: u32,
        handler: impl Fn(EndpointId, SharedView, Replier) + Send + Sync + 'static,
    ) {
        let inner = Arc::downgrade(&self.inner);
        let raw: RawHandler = Arc::new(move |endpoint, seq_id, data| {
            let replier = Replier {
                inner: inner.clone(),
                endpoint,
                seq_id,
                method,
            };
            handler(endpoint, data, replier);
        });
        let mut handlers = self.inner.handlers.write();
        if handlers.len() <= method as usize {
            handlers.resize(method as usize + 1, None);
        }
        handlers[method as usize] = Some(raw);
    }

    /// Issue a request; the future resolves with the correlated response,
    /// with `"timeout exceeded"` once `timeout` passes, or with
    /// `"too many pending messages"` when the send is refused outright.
    pub fn request(
        &self,
        endpoint: EndpointId,
        method: u32,
        data: Bytes,
        timeout: Duration,
    ) -> Future<RpcResult> {
        let inner = &self.inner;
        let seq_id = inner.seq_id.fetch_add(1, Ordering::Relaxed);
        let promise = Promise::new();
        let result = promise.future();
        // Registered before the send: a response cannot outrun the entry.
        inner.sent_requests.lock().insert(seq_id, promise);

        let message = Message {
            seq_id,
            kind: MessageKind::Request,
            method,
            data: SharedView::from_bytes(data),
        };
        if !inner.send_item(endpoint, message) {
            let claimed = inner.sent_requests.lock().remove(&seq_id);
            if let Some(promise) = claimed {
                promise.set_value(Err(RpcError::TooManyPending));
            }
            return result;
        }

        let timeout_inner = Arc::downgrade(inner);
        inner.exec.schedule(
            Box::new(move || {
                let Some(inner) = timeout_inner.upgrade() else {
                    return;
                };
                // Removing the entry claims the request; a response
                // arriving later misses the map and is dropped.
                let claimed = inner.sent_requests.lock().remove(&seq_id);
                if let Some(promise) = claimed {
                    trace!(seq_id, "request timed out");
                    promise.set_value(Err(RpcError::TimeoutExceeded));
                }
            }),
            timeout,
        );

        result
    }
}

impl Drop for ProtoBus {
    fn drop(&mut self) {
        self.inner.bus.shutdown();
        if let Some(io) = self.io_thread.lock().take() {
            let _ = io.join();
        }
    }
}

impl Inner {
    fn handle(&self, handle: ConnHandle, view: SharedView) {
        if self.endpoints.transient(handle.endpoint) {
            self.handle_greeting(handle, &view);
            return;
        }
        match codec::decode_batch(&view) {
            Ok(items) => {
                for item in items {
                    self.dispatch(handle.endpoint, item);
                }
            }
            Err(err) => {
                warn!(%err, endpoint = handle.endpoint, "malformed batch; dropping connection");
                self.bus.close(handle.conn_id);
            }
        }
    }

    fn handle_greeting(&self, handle: ConnHandle, view: &SharedView) {
        match Greeting::decode(view) {
            Ok(Greeting {
                endpoint_id: Some(forced),
                ..
            }) => {
                debug!(conn = handle.conn_id, endpoint = forced, "greeted with forced endpoint");
                self.bus.rebind(handle.conn_id, forced);
            }
            Ok(Greeting { port, .. }) => {
                let endpoint = self.endpoints.resolve(handle.peer.ip(), port);
                debug!(conn = handle.conn_id, endpoint, "greeted");
                self.bus.rebind(handle.conn_id, endpoint);
            }
            Err(err) => {
                warn!(%err, conn = handle.conn_id, "malformed greeting; dropping connection");
                self.bus.close(handle.conn_id);
            }
        }
    }

    fn dispatch(&self, endpoint: EndpointId, item: Message) {
        match item.kind {
            MessageKind::Request => {
                let handler = self
                    .handlers
                    .read()
                    .get(item.method as usize)
                    .cloned()
                    .flatten();
                match handler {
                    Some(handler) => handler(endpoint, item.seq_id, item.data),
                    None => {
                        warn!(err = %BusError::InvalidHandler(item.method), endpoint, "bus error");
                    }
                }
            }
            MessageKind::Response => {
                let claimed = self.sent_requests.lock().remove(&item.seq_id);
                let Some(promise) = claimed else {
                    trace!(seq_id = item.seq_id, "response after timeout; dropped");
                    return;
                };
                if self.split {
                    // Deliver off the I/O thread.
                    let data = item.data;
                    self.exec.schedule(
                        Box::new(move || promise.set_value(Ok(data))),
                        Duration::ZERO,
                    );
                } else {
                    promise.set_value(Ok(item.data));
                }
            }
        }
    }

    /// Append to the endpoint's batch, flushing synchronously once it
    /// reaches `max_batch` records.
    fn send_item(&self, endpoint: EndpointId, item: Message) -> bool {
        let to_flush = {
            let mut accumulated = self.accumulated.lock();
            let batch = accumulated.entry(endpoint).or_default();
            batch.push(item);
            if batch.len() >= self.max_batch {
                Some(std::mem::take(batch))
            } else {
                None
            }
        };
        match to_flush {
            Some(batch) => self.flush_batch(endpoint, &batch),
            None => true,
        }
    }

    fn flush_batch(&self, endpoint: EndpointId, batch: &[Message]) -> bool {
        if batch.is_empty() {
            return true;
        }
        let len = codec::encoded_batch_len(batch);
        if len > self.buffers.slab_size() {
            warn!(len, endpoint, "batch exceeds frame capacity; dropped");
            return false;
        }
        let mut buf = self.buffers.acquire();
        {
            let mut dst: &mut [u8] = buf.as_mut();
            codec::encode_batch(batch, &mut dst);
        }
        self.bus.send(endpoint, buf.freeze(len))
    }

    /// Swap out every accumulated batch and flush them; runs on the
    /// periodic flusher.
    fn timed_flush(&self) {
        let accumulated = std::mem::take(&mut *self.accumulated.lock());
        for (endpoint, batch) in accumulated {
            if !self.flush_batch(endpoint, &batch) {
                warn!(endpoint, "periodic flush refused; requests will time out");
            }
        }
    }
}
