//! Reusable byte buffers for capturing response bodies.
//!
//! A [`PooledBuffer`] is exclusively owned. Whoever holds it last returns its
//! storage to the pool on drop, so a buffer abandoned by a timed-out worker
//! is reclaimed once that worker finishes, never while it is still writing.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Initial capacity of freshly allocated buffers.
pub const DEFAULT_BUFFER_CAPACITY: usize = 4 * 1024;

/// Buffers that grew beyond this are dropped instead of pooled.
pub const MAX_POOLED_CAPACITY: usize = 1024 * 1024;

/// Maximum number of idle buffers kept by default.
pub const DEFAULT_MAX_IDLE: usize = 256;

/// Shared pool of idle buffers.
#[derive(Debug)]
pub struct BufferPool {
    idle: Mutex<Vec<BytesMut>>,
    max_idle: usize,
}

impl BufferPool {
    pub fn new(max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::with_capacity(max_idle.min(DEFAULT_MAX_IDLE))),
            max_idle,
        })
    }

    /// Take an empty buffer, reusing an idle one when available.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(DEFAULT_BUFFER_CAPACITY));

        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Number of idle buffers currently held.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn release(&self, mut buf: BytesMut) {
        if buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        buf.clear();

        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle: DEFAULT_MAX_IDLE,
        }
    }
}

/// A buffer checked out of a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_returns_to_pool_on_drop() {
        let pool = BufferPool::new(4);
        assert_eq!(pool.idle_count(), 0);

        let mut buf = pool.acquire();
        buf.extend_from_slice(b"hello");
        drop(buf);

        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_reused_buffer_is_empty() {
        let pool = BufferPool::new(4);
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"stale data");
        drop(buf);

        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_pool_respects_max_idle() {
        let pool = BufferPool::new(2);
        let buffers: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        drop(buffers);

        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn test_oversized_buffer_is_not_pooled() {
        let pool = BufferPool::new(4);
        let mut buf = pool.acquire();
        buf.reserve(MAX_POOLED_CAPACITY * 2);
        drop(buf);

        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_buffer_moved_across_threads_still_returns() {
        let pool = BufferPool::new(4);
        let mut buf = pool.acquire();

        std::thread::spawn(move || {
            buf.extend_from_slice(b"written elsewhere");
        })
        .join()
        .unwrap();

        assert_eq!(pool.idle_count(), 1);
    }
}
