//! Buffer pool shared by the reader loop, the writer loop and callers
//!
//! A `PooledBuf` owns its bytes outright and goes back to the free list when
//! dropped, so a buffer moved into a queue can never be touched by the side
//! that handed it over.

use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Buffers with more capacity than this are freed instead of pooled
pub const MAX_POOLABLE_SIZE: usize = 64 * 1024;

struct PoolInner {
    free: ArrayQueue<Vec<u8>>,
    default_buffer_size: usize,
}

/// Bounded LIFO-ish pool of byte buffers
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Pool retaining at most `max_buffers` idle buffers
    pub fn new(max_buffers: usize, default_buffer_size: usize) -> Self {
        BufferPool {
            inner: Arc::new(PoolInner {
                free: ArrayQueue::new(max_buffers.max(1)),
                default_buffer_size: default_buffer_size.max(1),
            }),
        }
    }

    /// Borrow an empty buffer with capacity for at least `min_size` bytes
    pub fn borrow(&self, min_size: usize) -> PooledBuf {
        let mut buf = match self.inner.free.pop() {
            Some(buf) if buf.capacity() >= min_size => buf,
            // Too small: let it go and allocate fresh
            _ => Vec::with_capacity(min_size.max(self.inner.default_buffer_size)),
        };
        buf.clear();
        PooledBuf {
            buf,
            pool: self.inner.clone(),
        }
    }

    /// Borrow a buffer holding a copy of `data`
    pub fn copy_from(&self, data: &[u8]) -> PooledBuf {
        let mut buf = self.borrow(data.len());
        buf.extend_from_slice(data);
        buf
    }

    /// Idle buffers currently held
    pub fn idle(&self) -> usize {
        self.inner.free.len()
    }

    /// Drop every idle buffer
    pub fn clear(&self) {
        while self.inner.free.pop().is_some() {}
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("idle", &self.idle())
            .field("capacity", &self.inner.free.capacity())
            .finish()
    }
}

/// A buffer on loan from a `BufferPool`
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        if buf.capacity() > 0 && buf.capacity() <= MAX_POOLABLE_SIZE {
            // A full pool just frees the buffer
            let _ = self.pool.free.push(buf);
        }
    }
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf").field("len", &self.len()).finish()
    }
}
