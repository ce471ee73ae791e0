//! Pooled network read buffers.
//!
//! All socket reads go through a shared pool of fixed-capacity `BytesMut`
//! buffers so the hot path allocates nothing. A buffer is owned by the
//! reader until the frame is enqueued, by the pipeline until publish
//! completes, and is returned to the pool when its [`PooledBuf`] guard drops.
//! The guard makes the release unconditional: error paths cannot leak a
//! buffer.

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lock-free pool of reusable read buffers.
pub struct BufferPool {
    queue: ArrayQueue<BytesMut>,
    buffer_capacity: usize,
    rented: AtomicU64,
    returned: AtomicU64,
    misses: AtomicU64,
}

impl BufferPool {
    /// Creates a pool with `pool_size` pre-allocated buffers of
    /// `buffer_capacity` bytes each.
    pub fn new(pool_size: usize, buffer_capacity: usize) -> Arc<Self> {
        let queue = ArrayQueue::new(pool_size.max(1));
        for _ in 0..pool_size {
            let _ = queue.push(BytesMut::with_capacity(buffer_capacity));
        }
        Arc::new(Self {
            queue,
            buffer_capacity,
            rented: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Rents a buffer. Falls back to a fresh allocation when the pool is
    /// momentarily empty; the allocation joins the pool on return.
    pub fn rent(self: &Arc<Self>) -> PooledBuf {
        let buf = match self.queue.pop() {
            Some(buf) => buf,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.buffer_capacity)
            }
        };
        self.rented.fetch_add(1, Ordering::Relaxed);
        PooledBuf {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn put_back(&self, mut buf: BytesMut) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        buf.clear();
        // Undersized buffers (split remnants) are dropped rather than pooled
        if buf.capacity() >= self.buffer_capacity {
            let _ = self.queue.push(buf);
        }
    }

    /// Number of buffers currently sitting in the pool.
    pub fn available(&self) -> usize {
        self.queue.len()
    }

    /// Capacity each rented buffer starts with.
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Buffers rented minus returned; bounded by in-flight frames under load.
    pub fn outstanding(&self) -> u64 {
        self.rented
            .load(Ordering::Relaxed)
            .saturating_sub(self.returned.load(Ordering::Relaxed))
    }

    /// Rents that could not be served from the pool.
    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// A rented buffer that returns itself to its pool on drop.
pub struct PooledBuf {
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// Read-only view of the buffered bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        // Invariant: buf is Some until drop
        self.buf.as_ref().expect("buffer taken")
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put_back(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.as_slice().len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rent_and_return() {
        let pool = BufferPool::new(2, 4096);
        assert_eq!(pool.available(), 2);

        let buf = pool.rent();
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.outstanding(), 1);
        drop(buf);

        assert_eq!(pool.available(), 2);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_exhausted_pool_allocates() {
        let pool = BufferPool::new(1, 64);
        let a = pool.rent();
        let b = pool.rent();
        assert_eq!(pool.miss_count(), 1);
        assert_eq!(pool.outstanding(), 2);
        drop(a);
        drop(b);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_returned_buffer_is_cleared() {
        let pool = BufferPool::new(1, 64);
        {
            let mut buf = pool.rent();
            buf.extend_from_slice(b"$GPRMC,stale");
        }
        let buf = pool.rent();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 64);
    }

    #[test]
    fn test_conservation_under_churn() {
        let pool = BufferPool::new(8, 128);
        for _ in 0..100 {
            let bufs: Vec<_> = (0..8).map(|_| pool.rent()).collect();
            drop(bufs);
        }
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 8);
    }
}
