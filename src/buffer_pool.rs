//! Fixed-capacity packet buffer pool enabling zero-copy forwarding.
//!
//! The pool pre-allocates `capacity` buffers of `element_size` bytes at creation time and never
//! grows afterwards. A free list backed by a lock-free [`ArrayQueue`] hands buffers out as owned
//! [`Mbuf`] handles; the handle returns its storage to the free list when dropped, so a buffer that
//! leaves the forwarding loop (transmitted, released or simply dropped) always finds its way back
//! and can never be touched again by the code that gave it up.

use crate::error::PoolError;
use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::sync::Arc;

/// Largest per-worker cache accepted by [`MbufPool::create`].
pub const MAX_CACHE_SIZE: usize = 512;

/// Headroom reserved in front of the frame data inside each element.
pub const MBUF_HEADROOM: usize = 128;

/// Default element size: 2 KiB of data room plus headroom.
pub const DEFAULT_MBUF_SIZE: usize = 2048 + MBUF_HEADROOM;

struct PoolShared {
    name: String,
    element_size: usize,
    cache_size: usize,
    free: ArrayQueue<Box<[u8]>>,
}

impl PoolShared {
    fn release(&self, storage: Box<[u8]>) {
        // The queue is sized to the pool capacity and only elements of this pool come back.
        let _ = self.free.push(storage);
    }
}

/// Shared handle to a buffer pool. Cloning is cheap.
#[derive(Clone)]
pub struct MbufPool {
    shared: Arc<PoolShared>,
}

impl MbufPool {
    /// Create a pool holding `capacity` buffers of `element_size` bytes.
    ///
    /// `cache_size` is the number of buffers a worker may keep locally; it must not exceed
    /// [`MAX_CACHE_SIZE`] or the capacity itself.
    pub fn create(
        name: &str,
        capacity: usize,
        cache_size: usize,
        element_size: usize,
    ) -> Result<MbufPool, PoolError> {
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity(name.to_string()));
        }
        if element_size <= MBUF_HEADROOM {
            return Err(PoolError::NoDataRoom(name.to_string()));
        }
        if cache_size > MAX_CACHE_SIZE || cache_size > capacity {
            return Err(PoolError::CacheTooLarge {
                name: name.to_string(),
                cache: cache_size,
                limit: MAX_CACHE_SIZE.min(capacity),
            });
        }

        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let _ = free.push(vec![0u8; element_size].into_boxed_slice());
        }

        Ok(MbufPool {
            shared: Arc::new(PoolShared {
                name: name.to_string(),
                element_size,
                cache_size,
                free,
            }),
        })
    }

    /// Borrow one buffer, or `None` when the pool is exhausted.
    pub fn alloc(&self) -> Option<Mbuf> {
        self.shared.free.pop().map(|storage| Mbuf {
            storage: Some(storage),
            len: 0,
            port: 0,
            pool: self.shared.clone(),
        })
    }

    /// Borrow up to `count` buffers into `out`, returning how many were appended.
    pub fn alloc_bulk(&self, count: usize, out: &mut Vec<Mbuf>) -> usize {
        let mut taken = 0;
        while taken < count {
            match self.alloc() {
                Some(mbuf) => {
                    out.push(mbuf);
                    taken += 1;
                }
                None => break,
            }
        }
        taken
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn capacity(&self) -> usize {
        self.shared.free.capacity()
    }

    pub fn cache_size(&self) -> usize {
        self.shared.cache_size
    }

    /// Bytes of frame data a single buffer can hold.
    pub fn data_room(&self) -> usize {
        self.shared.element_size - MBUF_HEADROOM
    }

    /// Buffers currently sitting in the free list.
    pub fn available(&self) -> usize {
        self.shared.free.len()
    }

    /// Buffers currently borrowed.
    pub fn in_use(&self) -> usize {
        self.capacity() - self.available()
    }
}

impl fmt::Debug for MbufPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MbufPool")
            .field("name", &self.shared.name)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

/// Exclusive handle to one pool buffer holding a single frame.
pub struct Mbuf {
    storage: Option<Box<[u8]>>,
    len: usize,
    port: u16,
    pool: Arc<PoolShared>,
}

impl Mbuf {
    /// Frame bytes.
    pub fn data(&self) -> &[u8] {
        match self.storage.as_ref() {
            Some(storage) => &storage[MBUF_HEADROOM..MBUF_HEADROOM + self.len],
            None => &[],
        }
    }

    /// Copy `frame` into the buffer, truncating to the data room. Returns the stored length.
    pub fn set_data(&mut self, frame: &[u8]) -> usize {
        let Some(storage) = self.storage.as_mut() else {
            return 0;
        };
        let room = storage.len() - MBUF_HEADROOM;
        let len = frame.len().min(room);
        storage[MBUF_HEADROOM..MBUF_HEADROOM + len].copy_from_slice(&frame[..len]);
        self.len = len;
        len
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Port the frame was received on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    /// Hand the buffer back to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            self.pool.release(storage);
        }
    }
}

impl fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mbuf")
            .field("pool", &self.pool.name)
            .field("port", &self.port)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rejects_bad_parameters() {
        assert!(matches!(
            MbufPool::create("p", 0, 0, DEFAULT_MBUF_SIZE),
            Err(PoolError::ZeroCapacity(_))
        ));
        assert!(matches!(
            MbufPool::create("p", 8, 0, 0),
            Err(PoolError::NoDataRoom(_))
        ));
        assert!(matches!(
            MbufPool::create("p", 8, 16, DEFAULT_MBUF_SIZE),
            Err(PoolError::CacheTooLarge { .. })
        ));
        assert!(matches!(
            MbufPool::create("p", 4096, 1024, DEFAULT_MBUF_SIZE),
            Err(PoolError::CacheTooLarge { .. })
        ));
    }

    #[test]
    fn buffers_return_on_drop() {
        let pool = MbufPool::create("p", 4, 0, DEFAULT_MBUF_SIZE).unwrap();
        let mut held = Vec::new();
        assert_eq!(pool.alloc_bulk(10, &mut held), 4);
        assert!(pool.alloc().is_none());
        assert_eq!(pool.in_use(), 4);

        held.pop().unwrap().release();
        assert_eq!(pool.available(), 1);
        held.clear();
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn set_data_truncates_to_data_room() {
        let pool = MbufPool::create("p", 1, 0, MBUF_HEADROOM + 4).unwrap();
        let mut mbuf = pool.alloc().unwrap();
        assert_eq!(mbuf.set_data(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(mbuf.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn recycled_buffers_start_empty() {
        let pool = MbufPool::create("p", 1, 0, DEFAULT_MBUF_SIZE).unwrap();
        let mut mbuf = pool.alloc().unwrap();
        mbuf.set_data(b"frame");
        drop(mbuf);
        let again = pool.alloc().unwrap();
        assert!(again.is_empty());
        assert_eq!(again.data(), b"");
    }
}
