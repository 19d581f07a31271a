//! Connection pool
//!
//! Owns every socket the bus knows about, grouped by destination endpoint,
//! and issues the opaque connection ids the event loop uses as poll
//! tokens. Pool-wide bookkeeping sits behind one mutex; per-connection
//! I/O state sits behind a per-record mutex so frame I/O on one socket
//! never contends with another.

use crate::buffer::{ScopedBuffer, SharedView};
use crate::endpoint::EndpointId;
use hashbrown::HashMap;
use mio::net::TcpStream;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

/// Opaque connection id; doubles as the poll token.
pub type ConnId = u64;

/// Idle connections closed per `close_old_conns` call.
const EVICT_BATCH: usize = 8;

/// Per-connection I/O state. Mutated only under the record's lock.
pub struct ConnIo {
    pub stream: TcpStream,
    /// Reusable ingress slab; `None` until the first readable event and
    /// right after a frame was delivered.
    pub ingress: Option<ScopedBuffer>,
    /// Bytes of the current frame read so far (header included).
    pub ingress_offset: usize,
    /// The single in-flight outgoing frame, if any.
    pub egress: Option<SharedView>,
    /// Bytes of header+payload written so far.
    pub egress_offset: usize,
}

/// One pooled connection.
pub struct Connection {
    id: ConnId,
    peer: SocketAddr,
    endpoint: AtomicU64,
    available: AtomicBool,
    last_used: Mutex<Instant>,
    io: Mutex<ConnIo>,
}

impl Connection {
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Remote address (for outbound connections, the dial target).
    #[inline]
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Endpoint this connection currently routes to; changes on rebind.
    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> EndpointId {
        self.endpoint.load(Ordering::Acquire)
    }

    #[inline]
    pub fn io(&self) -> &Mutex<ConnIo> {
        &self.io
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Atomically take the connection for a send. `true` when won.
    pub(crate) fn try_claim(&self) -> bool {
        self.available.swap(false, Ordering::AcqRel)
    }

    fn release(&self) {
        self.available.store(true, Ordering::Release);
    }

    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }
}

#[derive(Default)]
struct PoolMaps {
    conns: HashMap<ConnId, Arc<Connection>>,
    by_endpoint: HashMap<EndpointId, Vec<ConnId>>,
}

/// Socket owner and conn-id allocator.
pub struct ConnectPool {
    next_id: AtomicU64,
    inner: Mutex<PoolMaps>,
}

impl Default for ConnectPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            // Id 0 is reserved for the loop waker token.
            next_id: AtomicU64::new(1),
            inner: Mutex::new(PoolMaps::default()),
        }
    }

    /// Mint a fresh opaque connection id.
    pub fn make_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Take ownership of `stream` under `id`, routed to `endpoint`.
    ///
    /// A connection created with an initial egress frame (the greeting)
    /// starts busy and becomes available once that frame is flushed.
    pub fn add(
        &self,
        stream: TcpStream,
        id: ConnId,
        endpoint: EndpointId,
        peer: SocketAddr,
        egress: Option<SharedView>,
    ) -> Arc<Connection> {
        let available = egress.is_none();
        let conn = Arc::new(Connection {
            id,
            peer,
            endpoint: AtomicU64::new(endpoint),
            available: AtomicBool::new(available),
            last_used: Mutex::new(Instant::now()),
            io: Mutex::new(ConnIo {
                stream,
                ingress: None,
                ingress_offset: 0,
                egress,
                egress_offset: 0,
            }),
        });
        let mut maps = self.inner.lock();
        maps.conns.insert(id, Arc::clone(&conn));
        maps.by_endpoint.entry(endpoint).or_default().push(id);
        conn
    }

    /// Look up by connection id.
    #[must_use]
    pub fn get(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.inner.lock().conns.get(&id).cloned()
    }

    /// An available connection for `endpoint`, marked busy; `None` when
    /// every connection is occupied (or none exists).
    #[must_use]
    pub fn select(&self, endpoint: EndpointId) -> Option<Arc<Connection>> {
        let maps = self.inner.lock();
        for id in maps.by_endpoint.get(&endpoint)? {
            if let Some(conn) = maps.conns.get(id) {
                if conn.try_claim() {
                    return Some(Arc::clone(conn));
                }
            }
        }
        None
    }

    /// Mark a busy connection idle again.
    pub fn set_available(&self, id: ConnId) {
        if let Some(conn) = self.get(id) {
            conn.touch();
            conn.release();
        }
    }

    /// Re-route a connection to a different endpoint (post-greeting).
    pub fn rebind(&self, id: ConnId, endpoint: EndpointId) {
        let mut maps = self.inner.lock();
        let Some(conn) = maps.conns.get(&id).cloned() else {
            return;
        };
        let old = conn.endpoint.swap(endpoint, Ordering::AcqRel);
        if let Some(ids) = maps.by_endpoint.get_mut(&old) {
            ids.retain(|&other| other != id);
        }
        maps.by_endpoint.entry(endpoint).or_default().push(id);
        trace!(conn = id, from = old, to = endpoint, "rebound connection");
    }

    /// Drop the record; the socket closes with its last reference.
    pub fn close(&self, id: ConnId) -> Option<Arc<Connection>> {
        let mut maps = self.inner.lock();
        let conn = maps.conns.remove(&id)?;
        if let Some(ids) = maps.by_endpoint.get_mut(&conn.endpoint()) {
            ids.retain(|&other| other != id);
        }
        Some(conn)
    }

    /// Connections routed to `endpoint`, or every connection when `None`.
    #[must_use]
    pub fn count_connections(&self, endpoint: Option<EndpointId>) -> usize {
        let maps = self.inner.lock();
        match endpoint {
            Some(endpoint) => maps.by_endpoint.get(&endpoint).map_or(0, Vec::len),
            None => maps.conns.len(),
        }
    }

    /// Evict least-recently-used idle connections; used when accept hits
    /// fd limits. Returns how many were closed.
    pub fn close_old_conns(&self) -> usize {
        let mut maps = self.inner.lock();
        let mut idle: Vec<(Instant, ConnId)> = maps
            .conns
            .values()
            .filter(|conn| conn.is_available())
            .map(|conn| (conn.last_used(), conn.id()))
            .collect();
        idle.sort();
        let mut closed = 0;
        for (_, id) in idle.into_iter().take(EVICT_BATCH) {
            if let Some(conn) = maps.conns.remove(&id) {
                if let Some(ids) = maps.by_endpoint.get_mut(&conn.endpoint()) {
                    ids.retain(|&other| other != id);
                }
                closed += 1;
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    fn stream_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        (TcpStream::from_std(client), server)
    }

    #[test]
    fn select_claims_and_releases() {
        let pool = ConnectPool::new();
        let (stream, _keep) = stream_pair();
        let id = pool.make_id();
        let addr = "127.0.0.1:1".parse().unwrap();
        pool.add(stream, id, 42, addr, None);

        let conn = pool.select(42).expect("fresh connection is available");
        assert_eq!(conn.id(), id);
        assert!(pool.select(42).is_none(), "claimed connection is busy");

        pool.set_available(id);
        assert!(pool.select(42).is_some());
    }

    #[test]
    fn greeting_connection_starts_busy() {
        let pool = ConnectPool::new();
        let (stream, _keep) = stream_pair();
        let id = pool.make_id();
        let addr = "127.0.0.1:1".parse().unwrap();
        let greeting = SharedView::copy_from_slice(b"hello");
        pool.add(stream, id, 7, addr, Some(greeting));
        assert!(pool.select(7).is_none());
    }

    #[test]
    fn rebind_moves_between_endpoints() {
        let pool = ConnectPool::new();
        let (stream, _keep) = stream_pair();
        let id = pool.make_id();
        let addr = "127.0.0.1:1".parse().unwrap();
        pool.add(stream, id, 100, addr, None);

        pool.rebind(id, 200);
        assert_eq!(pool.count_connections(Some(100)), 0);
        assert_eq!(pool.count_connections(Some(200)), 1);
        assert_eq!(pool.get(id).unwrap().endpoint(), 200);
    }

    #[test]
    fn close_drops_the_socket() {
        let pool = ConnectPool::new();
        let (stream, mut server) = stream_pair();
        let id = pool.make_id();
        let addr = "127.0.0.1:1".parse().unwrap();
        pool.add(stream, id, 5, addr, None);
        assert_eq!(pool.count_connections(None), 1);

        let conn = pool.close(id).unwrap();
        drop(conn);
        assert_eq!(pool.count_connections(None), 0);
        assert!(pool.get(id).is_none());

        // Peer observes the close once buffers drain.
        let mut seen_error = false;
        for _ in 0..50 {
            match server.write(b"x") {
                Ok(_) => std::thread::sleep(std::time::Duration::from_millis(10)),
                Err(_) => {
                    seen_error = true;
                    break;
                }
            }
        }
        assert!(seen_error, "write to closed peer keeps succeeding");
    }

    #[test]
    fn close_old_conns_evicts_idle_only() {
        let pool = ConnectPool::new();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut keep = Vec::new();

        let (stream, server) = stream_pair();
        keep.push(server);
        let idle_id = pool.make_id();
        pool.add(stream, idle_id, 1, addr, None);

        let (stream, server) = stream_pair();
        keep.push(server);
        let busy_id = pool.make_id();
        pool.add(stream, busy_id, 1, addr, None);

        // Claim both, then release only the first: exactly one idle.
        let first = pool.select(1).unwrap();
        let second = pool.select(1).unwrap();
        assert_ne!(first.id(), second.id());
        pool.set_available(idle_id);
        let busy_id = if first.id() == idle_id {
            second.id()
        } else {
            first.id()
        };

        let closed = pool.close_old_conns();
        assert_eq!(closed, 1);
        assert!(pool.get(idle_id).is_none());
        assert!(pool.get(busy_id).is_some());
    }
}
