//! Pooled buffers and zero-copy views
//!
//! All on-wire data is addressed as [`SharedView`]s so framing, handler
//! delivery and requeue-on-error never copy payload bytes.
//!
//! Lifecycle:
//! - [`BufferPool::acquire`] hands out a [`ScopedBuffer`] (exclusive, mutable)
//! - [`ScopedBuffer::freeze`] turns it into a [`SharedView`] (shared, immutable)
//! - when the last view over a slab drops, the slab re-enters the free list
//!
//! The pool is bounded: at most `max_slabs` slabs exist at once, so memory
//! cannot grow without limit under load.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::ops::Deref;
use std::sync::Arc;

/// Default bound on the number of slabs a pool will allocate.
pub const DEFAULT_POOL_SLABS: usize = 1024;

struct PoolState {
    free: Vec<Box<[u8]>>,
    allocated: usize,
}

struct PoolInner {
    slab_size: usize,
    max_slabs: usize,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl PoolInner {
    fn release(&self, slab: Box<[u8]>) {
        let mut state = self.state.lock();
        state.free.push(slab);
        drop(state);
        self.released.notify_one();
    }
}

/// A bounded allocator of reusable fixed-size byte slabs.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Pool of `slab_size`-byte slabs with the default slab bound.
    #[must_use]
    pub fn new(slab_size: usize) -> Self {
        Self::with_capacity(slab_size, DEFAULT_POOL_SLABS)
    }

    /// Pool allocating at most `max_slabs` slabs of `slab_size` bytes.
    ///
    /// Slabs are allocated lazily and recycled through a free list.
    #[must_use]
    pub fn with_capacity(slab_size: usize, max_slabs: usize) -> Self {
        assert!(slab_size > 0 && max_slabs > 0);
        Self {
            inner: Arc::new(PoolInner {
                slab_size,
                max_slabs,
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    allocated: 0,
                }),
                released: Condvar::new(),
            }),
        }
    }

    /// Size of every slab this pool hands out.
    #[inline]
    #[must_use]
    pub fn slab_size(&self) -> usize {
        self.inner.slab_size
    }

    /// Take a slab out of the pool.
    ///
    /// **Blocks** the calling thread when `max_slabs` slabs are outstanding
    /// and none is free, until another slab is released. This is the pool's
    /// backpressure point; callers on latency-sensitive paths should size
    /// the pool for their peak in-flight frame count.
    #[must_use]
    pub fn acquire(&self) -> ScopedBuffer {
        let mut state = self.inner.state.lock();
        let slab = loop {
            if let Some(slab) = state.free.pop() {
                break slab;
            }
            if state.allocated < self.inner.max_slabs {
                state.allocated += 1;
                drop(state);
                break vec![0u8; self.inner.slab_size].into_boxed_slice();
            }
            self.inner.released.wait(&mut state);
        };
        ScopedBuffer {
            slab: Some(slab),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Number of slabs currently sitting in the free list.
    #[must_use]
    pub fn idle_slabs(&self) -> usize {
        self.inner.state.lock().free.len()
    }
}

/// Exclusive mutable access to one pooled slab.
///
/// Dropping an unfrozen buffer returns the slab to the pool.
pub struct ScopedBuffer {
    slab: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl ScopedBuffer {
    /// Full writable capacity of the slab.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slab.as_ref().map_or(0, |s| s.len())
    }

    /// Mutable view over the whole slab.
    #[inline]
    pub fn as_mut(&mut self) -> &mut [u8] {
        self.slab.as_mut().expect("slab present until drop")
    }

    /// Immutable view over the whole slab.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.slab.as_ref().expect("slab present until drop")
    }

    /// Freeze the first `len` bytes into a refcounted immutable view.
    ///
    /// The slab returns to the pool once the view (and every view derived
    /// from it) has been dropped.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the slab capacity.
    #[must_use]
    pub fn freeze(mut self, len: usize) -> SharedView {
        let slab = self.slab.take().expect("slab present until drop");
        assert!(len <= slab.len(), "freeze length exceeds slab capacity");
        let owner = SlabOwner {
            slab: Some(slab),
            pool: Arc::clone(&self.pool),
        };
        SharedView {
            bytes: Bytes::from_owner(owner).slice(..len),
        }
    }
}

impl Drop for ScopedBuffer {
    fn drop(&mut self) {
        if let Some(slab) = self.slab.take() {
            self.pool.release(slab);
        }
    }
}

/// Owner passed into `Bytes::from_owner`.
///
/// Guarantees the slab stays alive while any view exists and re-enters the
/// pool free list when the last view drops.
struct SlabOwner {
    slab: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl AsRef<[u8]> for SlabOwner {
    fn as_ref(&self) -> &[u8] {
        self.slab.as_ref().expect("slab present until drop")
    }
}

impl Drop for SlabOwner {
    fn drop(&mut self) {
        if let Some(slab) = self.slab.take() {
            self.pool.release(slab);
        }
    }
}

/// A shared reference to a byte range inside a buffer.
///
/// Cloning and slicing are refcount operations; payload bytes are never
/// copied. Handlers that need data beyond their own return clone the view.
#[derive(Clone, Debug)]
pub struct SharedView {
    bytes: Bytes,
}

impl SharedView {
    /// View over bytes that do not come from a pool (user payloads).
    #[inline]
    #[must_use]
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self { bytes }
    }

    /// View owning a copy of `data`.
    #[must_use]
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self {
            bytes: Bytes::copy_from_slice(data),
        }
    }

    /// View starting `n` bytes in, without copying.
    ///
    /// # Panics
    ///
    /// Panics if `n > self.len()`.
    #[must_use]
    pub fn skip(&self, n: usize) -> Self {
        assert!(n <= self.bytes.len(), "skip past end of view");
        Self {
            bytes: self.bytes.slice(n..),
        }
    }

    /// Sub-view of `len` bytes starting at `offset`, without copying.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the view.
    #[must_use]
    pub fn slice(&self, offset: usize, len: usize) -> Self {
        Self {
            bytes: self.bytes.slice(offset..offset + len),
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// The underlying refcounted bytes.
    #[inline]
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        self.bytes.clone()
    }
}

impl Deref for SharedView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsRef<[u8]> for SharedView {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}
