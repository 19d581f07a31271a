//! The readiness-driven TCP event loop
//!
//! One I/O thread multiplexes every connection of a bus instance. Frames
//! are an 8-byte little-endian length followed by the payload, nothing
//! else. Connection readiness is edge-triggered, so every ready source is
//! drained until it would block.
//!
//! Threading: the loop thread owns the poll and performs all reads. Sends
//! may run an immediate write on the caller's thread; the per-connection
//! record lock serializes that against the loop. No lock is held across a
//! handler invocation or a poll wait.

use crate::action_map::{Action, ActionMap};
use crate::buffer::{BufferPool, SharedView};
use crate::endpoint::{EndpointId, EndpointManager};
use crate::error::{BusError, Result};
use crate::executor::Executor;
use crate::options::TcpOptions;
use crate::pool::{ConnId, ConnIo, ConnectPool, Connection};
use hashbrown::HashMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Length prefix preceding every frame payload.
pub const HEADER_LEN: usize = 8;

const WAKER_TOKEN: Token = Token(0);
const LISTEN_BACKLOG: i32 = 1024;
const EVENTS_CAPACITY: usize = 1024;

pub(crate) fn write_header(len: usize, buf: &mut [u8; HEADER_LEN]) {
    *buf = (len as u64).to_le_bytes();
}

pub(crate) fn read_header(buf: &[u8]) -> usize {
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&buf[..HEADER_LEN]);
    u64::from_le_bytes(header) as usize
}

/// Identity of the connection a frame arrived on, as seen by the handler.
#[derive(Debug, Clone, Copy)]
pub struct ConnHandle {
    pub conn_id: ConnId,
    /// Endpoint the connection routes to right now; transient until the
    /// protocol layer rebinds it.
    pub endpoint: EndpointId,
    /// Remote socket address.
    pub peer: SocketAddr,
}

/// Invoked on the loop thread for every inbound frame. Must not block;
/// the view is valid until return — clone it to keep the bytes.
pub type Handler = Box<dyn Fn(ConnHandle, SharedView) + Send + Sync>;

/// Produces the first frame written on a fresh outbound connection.
pub type Greeter = Box<dyn Fn(EndpointId) -> SharedView + Send + Sync>;

enum IngressStep {
    Frame(SharedView),
    WouldBlock,
    Close,
}

enum EgressStep {
    Flushed,
    Idle,
    WouldBlock,
    Error(Option<SharedView>),
}

struct Shared {
    opts: TcpOptions,
    local_addr: SocketAddr,
    pool: ConnectPool,
    buffers: BufferPool,
    endpoints: Arc<EndpointManager>,
    registry: Registry,
    waker: Waker,
    listener_id: ConnId,
    pending: Mutex<HashMap<EndpointId, VecDeque<SharedView>>>,
    actions: Mutex<ActionMap>,
    handler: OnceCell<Handler>,
    greeter: OnceCell<Greeter>,
    shut_down: AtomicBool,
}

struct LoopState {
    poll: Poll,
    events: Events,
    listener: TcpListener,
}

/// The point-to-point frame bus.
///
/// Construct with [`TcpBus::new`], install a handler, then drive the loop
/// from a dedicated thread with [`TcpBus::run`]. `send` is safe from any
/// thread.
pub struct TcpBus {
    shared: Arc<Shared>,
    loop_state: Mutex<Option<LoopState>>,
}

impl TcpBus {
    /// Bind the listen socket and set up the poll.
    ///
    /// Startup failures (bind, poll registration) propagate; everything
    /// after `run` starts is absorbed by the loop.
    pub fn new(
        opts: TcpOptions,
        buffers: BufferPool,
        endpoints: Arc<EndpointManager>,
    ) -> Result<Self> {
        if buffers.slab_size() < HEADER_LEN + opts.max_message_size {
            return Err(BusError::protocol(format!(
                "buffer pool slabs of {} bytes cannot hold a max-size frame",
                buffers.slab_size()
            )));
        }

        let listener = bind_listener(opts.port)?;
        let local_addr = listener.local_addr()?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let pool = ConnectPool::new();
        let listener_id = pool.make_id();
        registry.register(
            &mut listener,
            Token(listener_id as usize),
            Interest::READABLE,
        )?;
        debug!(%local_addr, "bus listening");

        Ok(Self {
            shared: Arc::new(Shared {
                opts,
                local_addr,
                pool,
                buffers,
                endpoints,
                registry,
                waker,
                listener_id,
                pending: Mutex::new(HashMap::new()),
                actions: Mutex::new(ActionMap::new()),
                handler: OnceCell::new(),
                greeter: OnceCell::new(),
                shut_down: AtomicBool::new(false),
            }),
            loop_state: Mutex::new(Some(LoopState {
                poll,
                events: Events::with_capacity(EVENTS_CAPACITY),
                listener,
            })),
        })
    }

    /// Address the listener actually bound (resolves port `0`).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    #[must_use]
    pub fn endpoints(&self) -> &Arc<EndpointManager> {
        &self.shared.endpoints
    }

    /// Install the inbound-frame handler. Must happen before `run`;
    /// later calls are ignored.
    pub fn set_handler(&self, handler: Handler) {
        if self.shared.handler.set(handler).is_err() {
            warn!("handler already installed; ignored");
        }
    }

    /// Install the greeting generator for fresh outbound connections.
    pub fn set_greeter(&self, greeter: Greeter) {
        if self.shared.greeter.set(greeter).is_err() {
            warn!("greeter already installed; ignored");
        }
    }

    /// Hand `view` to `endpoint`.
    ///
    /// Assigns the frame to an available connection (opening new ones up
    /// to the configured fan-out) and attempts an immediate write on the
    /// calling thread; otherwise the frame queues per endpoint. `false`
    /// when the pending cap is exceeded, the endpoint is still transient,
    /// or the payload exceeds `max_message_size`.
    pub fn send(&self, endpoint: EndpointId, view: SharedView) -> bool {
        let shared = &self.shared;
        if shared.endpoints.transient(endpoint) {
            warn!(err = %BusError::TransientEndpoint(endpoint), "send rejected");
            return false;
        }
        if view.len() > shared.opts.max_message_size {
            let err = BusError::MessageTooLarge {
                size: view.len(),
                max: shared.opts.max_message_size,
            };
            warn!(%err, "send rejected");
            return false;
        }

        shared.fix_pool_size(endpoint);
        if let Some(conn) = shared.pool.select(endpoint) {
            {
                let mut io = conn.io().lock();
                debug_assert!(io.egress.is_none(), "available connection had a frame in flight");
                io.egress = Some(view);
                io.egress_offset = 0;
            }
            shared.drive_egress(&conn);
            true
        } else {
            {
                let mut pending = shared.pending.lock();
                let queue = pending.entry(endpoint).or_default();
                if let Some(cap) = shared.opts.max_pending_messages {
                    if queue.len() >= cap {
                        return false;
                    }
                }
                queue.push_back(view);
            }
            // A connection may have gone idle between the failed select
            // and the enqueue; pick the frame back up if so.
            shared.kick_pending(endpoint);
            true
        }
    }

    /// Re-route a connection after its greeting identified the peer.
    pub fn rebind(&self, conn_id: ConnId, endpoint: EndpointId) {
        self.shared.pool.rebind(conn_id, endpoint);
        // Traffic may already be queued for the stable endpoint.
        self.shared.kick_pending(endpoint);
    }

    /// Drop a connection (e.g. after a malformed greeting).
    pub fn close(&self, conn_id: ConnId) {
        if let Some(conn) = self.shared.pool.get(conn_id) {
            self.shared.close_conn(&conn, false);
        }
    }

    /// Connections routed to `endpoint`, or all of them; for sizing.
    #[must_use]
    pub fn count_connections(&self, endpoint: Option<EndpointId>) -> usize {
        self.shared.pool.count_connections(endpoint)
    }

    /// Make `run` return. Safe from any thread; idempotent.
    pub fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::Release);
        if let Err(err) = self.shared.waker.wake() {
            warn!(%err, "failed to wake event loop for shutdown");
        }
    }

    /// Drive the readiness loop until `shutdown`.
    ///
    /// Exactly one thread may run this; a second call returns
    /// [`BusError::AlreadyRunning`].
    pub fn run(&self) -> Result<()> {
        let mut state = self
            .loop_state
            .lock()
            .take()
            .ok_or(BusError::AlreadyRunning)?;
        let shared = &self.shared;

        while !shared.shut_down.load(Ordering::Acquire) {
            shared.run_due_actions();
            let timeout = shared
                .actions
                .lock()
                .next_time_point()
                .map(|at| at.saturating_duration_since(Instant::now()));

            if let Err(err) = state.poll.poll(&mut state.events, timeout) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            for event in state.events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                if token.0 as u64 == shared.listener_id {
                    shared.accept_conns(&mut state.listener)?;
                    continue;
                }
                shared.handle_conn_event(
                    token.0 as ConnId,
                    event.is_readable(),
                    event.is_writable(),
                    event.is_error(),
                );
            }
        }

        // Break the re-arm chain of any periodic actions still queued.
        *shared.actions.lock() = ActionMap::new();
        debug!("event loop stopped");
        Ok(())
    }
}

impl Executor for TcpBus {
    /// Actions run on the loop thread between poll rounds.
    fn schedule_at(&self, action: Action, deadline: Instant) {
        self.shared.actions.lock().insert(deadline, action);
        if let Err(err) = self.shared.waker.wake() {
            warn!(%err, "failed to wake event loop for scheduled action");
        }
    }
}

impl Shared {
    fn run_due_actions(&self) {
        loop {
            let action = {
                let mut actions = self.actions.lock();
                match actions.next_time_point() {
                    Some(at) if at <= Instant::now() => actions.pick_action(),
                    _ => None,
                }
            };
            match action {
                Some(action) => action(),
                None => break,
            }
        }
    }

    /// Open connections to `endpoint` until the fan-out target is met.
    fn fix_pool_size(&self, endpoint: EndpointId) {
        let Some(addr) = self.endpoints.address_of(endpoint) else {
            return;
        };
        let mut count = self.pool.count_connections(Some(endpoint));
        while count < self.opts.fixed_pool_size {
            match self.open_connection(endpoint, addr) {
                Ok(()) => count += 1,
                Err(err) => {
                    warn!(%err, endpoint, "outbound connect failed");
                    break;
                }
            }
        }
    }

    fn open_connection(&self, endpoint: EndpointId, addr: SocketAddr) -> io::Result<()> {
        let mut stream = TcpStream::connect(addr)?;
        if let Err(err) = stream.set_nodelay(true) {
            trace!(%err, "could not set TCP_NODELAY");
        }
        let id = self.pool.make_id();
        self.registry.register(
            &mut stream,
            Token(id as usize),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        // The greeting goes out first; the connection stays busy until it
        // has been flushed.
        let greeting = self.greeter.get().map(|greet| greet(endpoint));
        self.pool.add(stream, id, endpoint, addr, greeting);
        trace!(conn = id, endpoint, %addr, "opened outbound connection");
        Ok(())
    }

    fn accept_conns(&self, listener: &mut TcpListener) -> Result<()> {
        let mut evicted = false;
        loop {
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        trace!(%err, "could not set TCP_NODELAY");
                    }
                    let id = self.pool.make_id();
                    let endpoint = self.endpoints.make_transient();
                    if let Err(err) = self.registry.register(
                        &mut stream,
                        Token(id as usize),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(%err, "failed to register accepted connection");
                        continue;
                    }
                    self.pool.add(stream, id, endpoint, peer, None);
                    trace!(conn = id, endpoint, %peer, "accepted connection");
                }
                Err(ref err) if would_block(err) => return Ok(()),
                Err(ref err) if interrupted(err) => {}
                Err(ref err) if fd_exhausted(err) => {
                    if evicted {
                        // Still starved after one eviction round; give the
                        // next readiness event a chance instead of spinning.
                        return Ok(());
                    }
                    let closed = self.pool.close_old_conns();
                    warn!(closed, "accept hit fd limits; evicted idle connections");
                    evicted = true;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn handle_conn_event(&self, id: ConnId, readable: bool, writable: bool, error: bool) {
        let Some(conn) = self.pool.get(id) else {
            trace!(conn = id, "event for unknown connection");
            return;
        };

        if error {
            let endpoint = conn.endpoint();
            debug!(conn = id, endpoint, "connection error event");
            self.close_conn(&conn, true);
            // Reopen right away only when traffic is already queued for
            // the peer; otherwise the next send takes care of it.
            if !self.endpoints.transient(endpoint) && self.has_pending(endpoint) {
                self.fix_pool_size(endpoint);
            }
            return;
        }

        if readable && !self.drive_ingress(&conn) {
            return;
        }
        if writable {
            self.drive_egress(&conn);
        }
    }

    /// Drain inbound data until it would block. Returns `false` when the
    /// connection was closed.
    fn drive_ingress(&self, conn: &Arc<Connection>) -> bool {
        loop {
            let step = {
                let mut io = conn.io().lock();
                self.read_step(&mut io)
            };
            match step {
                IngressStep::Frame(view) => {
                    let handle = ConnHandle {
                        conn_id: conn.id(),
                        // Re-read per frame: a greeting may have rebound
                        // the connection between two frames of one drain.
                        endpoint: conn.endpoint(),
                        peer: conn.peer(),
                    };
                    match self.handler.get() {
                        Some(handler) => handler(handle, view),
                        None => warn!(conn = conn.id(), "frame dropped: no handler installed"),
                    }
                }
                IngressStep::WouldBlock => return true,
                IngressStep::Close => {
                    self.close_conn(conn, true);
                    return false;
                }
            }
        }
    }

    /// One ingress state-machine step: read until a frame completes, the
    /// socket would block, or the connection is dead.
    fn read_step(&self, io: &mut ConnIo) -> IngressStep {
        loop {
            if io.ingress.is_none() {
                io.ingress = Some(self.buffers.acquire());
                io.ingress_offset = 0;
            }
            let offset = io.ingress_offset;
            let buf = io.ingress.as_mut().expect("ingress buffer installed above");

            // Re-derived every iteration from the buffered header bytes.
            let expect = if offset < HEADER_LEN {
                HEADER_LEN
            } else {
                let len = read_header(buf.as_slice());
                if len > self.opts.max_message_size {
                    let err = BusError::MessageTooLarge {
                        size: len,
                        max: self.opts.max_message_size,
                    };
                    warn!(%err, "peer announced oversized frame");
                    return IngressStep::Close;
                }
                HEADER_LEN + len
            };

            if offset == expect && offset >= HEADER_LEN {
                // Complete frame; a bare header is a zero-length payload.
                let buf = io.ingress.take().expect("ingress buffer installed above");
                io.ingress_offset = 0;
                return IngressStep::Frame(buf.freeze(expect).skip(HEADER_LEN));
            }

            match io.stream.read(&mut buf.as_mut()[offset..expect]) {
                Ok(0) => {
                    trace!("peer closed the connection");
                    return IngressStep::Close;
                }
                Ok(n) => io.ingress_offset = offset + n,
                Err(ref err) if would_block(err) => return IngressStep::WouldBlock,
                Err(ref err) if interrupted(err) => {}
                Err(err) => {
                    debug!(%err, "read failed");
                    return IngressStep::Close;
                }
            }
        }
    }

    /// Push the in-flight frame (and any queued successors) out until the
    /// socket would block or the queue drains.
    fn drive_egress(&self, conn: &Arc<Connection>) {
        loop {
            let step = {
                let mut io = conn.io().lock();
                write_step(&mut io)
            };
            match step {
                EgressStep::Flushed => {
                    conn.touch();
                    let endpoint = conn.endpoint();
                    // Pull the next queued frame while still busy, so no
                    // other sender can double-assign. The reclaim round
                    // closes the race against a send that enqueues while
                    // we release the connection.
                    let assigned = loop {
                        let next = {
                            let mut pending = self.pending.lock();
                            pending.get_mut(&endpoint).and_then(VecDeque::pop_front)
                        };
                        if let Some(view) = next {
                            let mut io = conn.io().lock();
                            io.egress = Some(view);
                            io.egress_offset = 0;
                            break true;
                        }
                        self.pool.set_available(conn.id());
                        if !self.has_pending(endpoint) || !conn.try_claim() {
                            break false;
                        }
                    };
                    if !assigned {
                        return;
                    }
                }
                EgressStep::Idle | EgressStep::WouldBlock => return,
                EgressStep::Error(leftover) => {
                    let endpoint = conn.endpoint();
                    if let Some(view) = leftover {
                        if !self.endpoints.transient(endpoint) {
                            // Head of the queue: it was next in line.
                            self.pending.lock().entry(endpoint).or_default().push_front(view);
                        }
                    }
                    self.close_conn(conn, false);
                    return;
                }
            }
        }
    }

    fn close_conn(&self, conn: &Arc<Connection>, requeue: bool) {
        let Some(conn) = self.pool.close(conn.id()) else {
            return;
        };
        let endpoint = conn.endpoint();
        let leftover = {
            let mut io = conn.io().lock();
            let _ = self.registry.deregister(&mut io.stream);
            io.ingress = None;
            io.egress_offset = 0;
            io.egress.take()
        };
        if requeue {
            if let Some(view) = leftover {
                if !self.endpoints.transient(endpoint) {
                    self.pending.lock().entry(endpoint).or_default().push_front(view);
                }
            }
        }
        debug!(conn = conn.id(), endpoint, "closed connection");
    }

    /// Marry queued frames to an idle connection, if both exist.
    fn kick_pending(&self, endpoint: EndpointId) {
        if !self.has_pending(endpoint) {
            return;
        }
        let Some(conn) = self.pool.select(endpoint) else {
            return;
        };
        let next = {
            let mut pending = self.pending.lock();
            pending.get_mut(&endpoint).and_then(VecDeque::pop_front)
        };
        match next {
            Some(view) => {
                {
                    let mut io = conn.io().lock();
                    io.egress = Some(view);
                    io.egress_offset = 0;
                }
                self.drive_egress(&conn);
            }
            None => self.pool.set_available(conn.id()),
        }
    }

    fn has_pending(&self, endpoint: EndpointId) -> bool {
        self.pending
            .lock()
            .get(&endpoint)
            .is_some_and(|queue| !queue.is_empty())
    }
}

/// One egress state-machine step under the record lock.
fn write_step(io: &mut ConnIo) -> EgressStep {
    let Some(message) = io.egress.clone() else {
        return EgressStep::Idle;
    };
    let mut header = [0u8; HEADER_LEN];
    write_header(message.len(), &mut header);
    let total = HEADER_LEN + message.len();

    loop {
        let offset = io.egress_offset;
        if offset >= total {
            io.egress = None;
            io.egress_offset = 0;
            return EgressStep::Flushed;
        }

        // Gathered write of header remainder + payload remainder.
        let written = if offset < HEADER_LEN {
            let slices = [
                IoSlice::new(&header[offset..]),
                IoSlice::new(message.as_slice()),
            ];
            io.stream.write_vectored(&slices)
        } else {
            io.stream.write(&message.as_slice()[offset - HEADER_LEN..])
        };

        match written {
            Ok(0) => {
                debug!("write returned zero; dropping connection");
                return EgressStep::Error(io.egress.take());
            }
            Ok(n) => io.egress_offset = offset + n,
            Err(ref err) if would_block(err) => return EgressStep::WouldBlock,
            // A connect still in flight reports NotConnected on some
            // platforms; the writable event retries once it completes.
            Err(ref err) if err.kind() == io::ErrorKind::NotConnected => {
                return EgressStep::WouldBlock
            }
            Err(ref err) if interrupted(err) => {}
            Err(err) => {
                debug!(%err, "write failed");
                return EgressStep::Error(io.egress.take());
            }
        }
    }
}

fn bind_listener(port: u16) -> io::Result<std::net::TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};
    let addr: SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, port).into();
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

fn interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}

fn fd_exhausted(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}
