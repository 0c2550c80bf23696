//! Lock-free pool of article-sized byte buffers
//!
//! Every in-flight request rents exactly one buffer of `article_size_limit`
//! bytes and returns it on drop. Buffers are never shared concurrently.

use crossbeam::queue::SegQueue;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A rented buffer that returns to the pool when dropped
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<SegQueue<Vec<u8>>>,
    pool_size: Arc<AtomicUsize>,
    max_pool_size: usize,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.buffer[..]
    }
}

impl DerefMut for PooledBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer[..]
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let current = self.pool_size.load(Ordering::Relaxed);
        if current < self.max_pool_size {
            let buffer = std::mem::take(&mut self.buffer);
            self.pool.push(buffer);
            self.pool_size.fetch_add(1, Ordering::Relaxed);
        }
        // Pool full: the buffer is simply dropped
    }
}

/// Lock-free buffer pool built on crossbeam's `SegQueue`
#[derive(Debug, Clone)]
pub struct BufferPool {
    pool: Arc<SegQueue<Vec<u8>>>,
    buffer_size: usize,
    max_pool_size: usize,
    pool_size: Arc<AtomicUsize>,
}

impl BufferPool {
    /// Create a pool handing out `buffer_size`-byte buffers, retaining at
    /// most `max_pool_size` of them between rentals.
    #[must_use]
    pub fn new(buffer_size: usize, max_pool_size: usize) -> Self {
        Self {
            pool: Arc::new(SegQueue::new()),
            buffer_size,
            max_pool_size,
            pool_size: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Rent a buffer; allocates when the pool is empty.
    ///
    /// Contents may hold data from a previous rental. Callers write before
    /// reading and only access `&buf[..n]` for the `n` bytes they filled.
    pub fn acquire(&self) -> PooledBuffer {
        let buffer = if let Some(buffer) = self.pool.pop() {
            self.pool_size.fetch_sub(1, Ordering::Relaxed);
            debug_assert_eq!(buffer.len(), self.buffer_size);
            buffer
        } else {
            vec![0u8; self.buffer_size]
        };

        PooledBuffer {
            buffer,
            pool: Arc::clone(&self.pool),
            pool_size: Arc::clone(&self.pool_size),
            max_pool_size: self.max_pool_size,
        }
    }

    /// Size of each buffer in bytes
    #[must_use]
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_returns_sized_buffer() {
        let pool = BufferPool::new(4096, 4);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 4096);
    }

    #[test]
    fn test_buffer_returns_on_drop() {
        let pool = BufferPool::new(1024, 2);

        let mut buf = pool.acquire();
        buf[0] = 42;
        drop(buf);

        // The returned buffer is reused, previous contents and all
        let buf2 = pool.acquire();
        assert_eq!(buf2.len(), 1024);
        assert_eq!(buf2[0], 42);
    }

    #[test]
    fn test_pool_does_not_retain_beyond_cap() {
        let pool = BufferPool::new(64, 1);

        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);

        assert_eq!(pool.pool_size.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_concurrent_rentals() {
        let pool = BufferPool::new(256, 8);
        let mut handles = vec![];

        for _ in 0..16 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let buf = pool.acquire();
                    assert_eq!(buf.len(), 256);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
