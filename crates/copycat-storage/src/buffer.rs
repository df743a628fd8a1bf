//! Encode Buffer Pool
//!
//! A thread-safe free list of `BytesMut` scratch buffers used on the entry
//! encode path. Appends are frequent and short-lived; reusing buffers keeps
//! the hot path allocation-free once the pool is warm.
//!
//! The pool is the only piece of storage state shared across threads, and it
//! holds its lock only long enough to push or pop a buffer.

use std::sync::Mutex;

use bytes::BytesMut;

/// A bounded free list of reusable encode buffers.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,

    /// Initial capacity of freshly allocated buffers.
    buffer_capacity: usize,

    /// Maximum buffers retained; excess released buffers are dropped.
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(buffer_capacity: usize, max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            buffer_capacity,
            max_pooled,
        }
    }

    /// Take a cleared buffer from the pool, allocating if the pool is empty.
    pub fn acquire(&self) -> BytesMut {
        let mut buffers = self.buffers.lock().expect("buffer pool poisoned");
        match buffers.pop() {
            Some(buffer) => buffer,
            None => BytesMut::with_capacity(self.buffer_capacity),
        }
    }

    /// Return a buffer to the pool.
    pub fn release(&self, mut buffer: BytesMut) {
        buffer.clear();
        let mut buffers = self.buffers.lock().expect("buffer pool poisoned");
        if buffers.len() < self.max_pooled {
            buffers.push(buffer);
        }
    }

    /// Number of buffers currently pooled.
    pub fn pooled(&self) -> usize {
        self.buffers.lock().expect("buffer pool poisoned").len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(4096, 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_acquire_allocates_when_empty() {
        let pool = BufferPool::new(128, 4);
        let buffer = pool.acquire();
        assert!(buffer.capacity() >= 128);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn test_release_recycles() {
        let pool = BufferPool::new(128, 4);
        let mut buffer = pool.acquire();
        buffer.put_slice(b"scratch");
        pool.release(buffer);
        assert_eq!(pool.pooled(), 1);

        let buffer = pool.acquire();
        assert!(buffer.is_empty(), "recycled buffer must come back cleared");
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = BufferPool::new(16, 2);
        for _ in 0..5 {
            pool.release(BytesMut::with_capacity(16));
        }
        assert_eq!(pool.pooled(), 2);
    }
}
