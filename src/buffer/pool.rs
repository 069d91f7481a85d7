//! Shared pool of fixed-size byte buffers.
//!
//! # Responsibilities
//! - Hand out buffers of a single configured size
//! - Take them back exactly once, whatever path the holder exits through
//! - Report live checkouts for leak detection and metrics

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;

use crate::error::{Error, ErrorKind, Result};

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Maximum number of buffers the pool may own.
    pub capacity: usize,
    /// Buffers allocated so far (free + live).
    pub allocated: usize,
    /// Buffers currently checked out.
    pub live: usize,
    /// Buffers sitting in the free queue.
    pub free: usize,
    /// Checkouts refused because the pool was exhausted.
    pub exhausted: usize,
}

struct PoolInner {
    free: ArrayQueue<BytesMut>,
    buffer_size: usize,
    capacity: usize,
    allocated: AtomicUsize,
    live: AtomicUsize,
    exhausted: AtomicUsize,
}

/// A lock-free pool of same-size buffers, shared across I/O and worker threads.
///
/// Cloning is cheap; all clones share the same buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("stats", &self.stats())
            .finish()
    }
}

impl BufferPool {
    /// Create a pool of at most `capacity` buffers of `buffer_size` bytes each.
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                free: ArrayQueue::new(capacity),
                buffer_size: buffer_size.max(1),
                capacity,
                allocated: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                exhausted: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a pool with every buffer allocated up front.
    pub fn preallocated(buffer_size: usize, capacity: usize) -> Self {
        let pool = Self::new(buffer_size, capacity);
        for _ in 0..pool.inner.capacity {
            let buf = BytesMut::with_capacity(pool.inner.buffer_size);
            if pool.inner.free.push(buf).is_ok() {
                pool.inner.allocated.fetch_add(1, Ordering::SeqCst);
            }
        }
        pool
    }

    /// Size of every buffer handed out.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Check a buffer out.
    ///
    /// Fails with [`ErrorKind::BufferPoolExhausted`] when every buffer is live.
    pub fn checkout(&self) -> Result<PooledBuffer> {
        let inner = &self.inner;
        if let Some(buf) = inner.free.pop() {
            return Ok(self.lease(buf));
        }

        // Reserve an allocation slot before allocating.
        let mut allocated = inner.allocated.load(Ordering::SeqCst);
        loop {
            if allocated >= inner.capacity {
                // A buffer may have come back since the first pop.
                if let Some(buf) = inner.free.pop() {
                    return Ok(self.lease(buf));
                }
                inner.exhausted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(capacity = inner.capacity, "Buffer pool exhausted");
                return Err(Error::new(ErrorKind::BufferPoolExhausted));
            }
            match inner.allocated.compare_exchange_weak(
                allocated,
                allocated + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(self.lease(BytesMut::with_capacity(inner.buffer_size))),
                Err(actual) => allocated = actual,
            }
        }
    }

    fn lease(&self, mut buf: BytesMut) -> PooledBuffer {
        buf.clear();
        let live = self.inner.live.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("sluice_buffer_pool_live").set(live as f64);
        PooledBuffer {
            buf,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Number of buffers currently checked out.
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Buffers available without exceeding the capacity (free + not yet allocated).
    pub fn available(&self) -> usize {
        self.inner.capacity.saturating_sub(self.live())
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.inner.capacity,
            allocated: self.inner.allocated.load(Ordering::SeqCst),
            live: self.inner.live.load(Ordering::SeqCst),
            free: self.inner.free.len(),
            exhausted: self.inner.exhausted.load(Ordering::Relaxed),
        }
    }
}

/// A checked-out buffer. Returned to its pool when dropped.
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Bytes the buffer can hold before it would need to grow.
    pub fn spare(&self) -> usize {
        self.capacity_limit().saturating_sub(self.len())
    }

    /// The configured pool buffer size.
    pub fn capacity_limit(&self) -> usize {
        self.pool.buffer_size
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .field("capacity_limit", &self.capacity_limit())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        // Buffers that grew past the pool size are replaced so every slot stays uniform.
        if buf.capacity() > self.pool.buffer_size * 2 {
            buf = BytesMut::with_capacity(self.pool.buffer_size);
        }
        // Leave the live count before the slot becomes visible to the next checkout.
        let live = self.pool.live.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!("sluice_buffer_pool_live").set(live as f64);
        if self.pool.free.push(buf).is_err() {
            self.pool.allocated.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
