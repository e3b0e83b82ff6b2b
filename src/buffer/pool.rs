//! Shared pool of fixed-capacity read buffers.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Buf;
use crossbeam_queue::ArrayQueue;

use crate::config::{ConduitConfig, MIN_BUFFER_SIZE};

/// A handle to a pooled resource that must be released exactly once.
///
/// Releasing consumes the handle, so the type system rules out a second
/// release through the same value.
pub trait Pooled {
    /// The resource exposed by this handle.
    type Resource: ?Sized;

    /// Returns the pooled resource.
    fn resource(&self) -> &Self::Resource;

    /// Returns the resource to its pool for reuse.
    fn free(self);

    /// Destroys the resource instead of recycling it.
    fn discard(self);
}

/// Counters describing the life of a [`BufferPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Buffers handed out and not yet released.
    pub outstanding: usize,
    /// Idle buffers waiting in the freelist.
    pub idle: usize,
    /// Total calls to [`BufferPool::allocate`].
    pub allocations: u64,
    /// Releases that went back to the freelist (or were dropped because it was full).
    pub recycled: u64,
    /// Releases that destroyed the buffer.
    pub discarded: u64,
}

struct PoolInner {
    buffer_size: usize,
    freelist: ArrayQueue<Box<[u8]>>,
    outstanding: AtomicUsize,
    allocations: AtomicU64,
    recycled: AtomicU64,
    discarded: AtomicU64,
}

impl PoolInner {
    fn release(&self, data: Box<[u8]>, discard: bool) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        if discard {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.recycled.fetch_add(1, Ordering::Relaxed);
        if data.len() == self.buffer_size {
            // Freelist full: the buffer is simply dropped
            let _ = self.freelist.push(data);
        }
    }
}

/// A pool of reusable, fixed-capacity byte buffers.
///
/// The pool is shared by every conduit of every connection that clones it.
/// Allocation pops an idle buffer from a lock-free freelist or creates a new
/// one; buffers come back when their [`PooledBuffer`] is freed or dropped.
///
/// # Example
///
/// ```
/// use dechunkrs::{BufferPool, ConduitConfig, Pooled};
///
/// let pool = BufferPool::new(&ConduitConfig::default().with_buffer_size(1024));
/// let buffer = pool.allocate();
/// assert_eq!(buffer.capacity(), 1024);
///
/// buffer.free();
/// assert_eq!(pool.stats().idle, 1);
/// ```
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Creates a pool using the buffer size and retention of `config`.
    ///
    /// A buffer size below [`MIN_BUFFER_SIZE`] is raised to it, so an
    /// unvalidated config never yields buffers that cannot hold any input.
    pub fn new(config: &ConduitConfig) -> Self {
        let buffer_size = config.buffer_size();
        if buffer_size < MIN_BUFFER_SIZE {
            log::warn!("buffer_size {buffer_size} is below {MIN_BUFFER_SIZE}, raising it");
        }
        Self::with_capacity(buffer_size.max(MIN_BUFFER_SIZE), config.pool_capacity())
    }

    /// Creates a pool of `buffer_size` buffers retaining at most `max_idle` of them.
    pub fn with_capacity(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                freelist: ArrayQueue::new(max_idle.max(1)),
                outstanding: AtomicUsize::new(0),
                allocations: AtomicU64::new(0),
                recycled: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// Takes an empty buffer from the pool, creating one if none is idle.
    pub fn allocate(&self) -> PooledBuffer {
        let data = self
            .inner
            .freelist
            .pop()
            .unwrap_or_else(|| vec![0; self.inner.buffer_size].into_boxed_slice());

        self.inner.outstanding.fetch_add(1, Ordering::Relaxed);
        self.inner.allocations.fetch_add(1, Ordering::Relaxed);

        PooledBuffer {
            data,
            position: 0,
            limit: 0,
            discard: false,
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Returns the capacity of buffers handed out by this pool.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Returns a snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            outstanding: self.inner.outstanding.load(Ordering::Relaxed),
            idle: self.inner.freelist.len(),
            allocations: self.inner.allocations.load(Ordering::Relaxed),
            recycled: self.inner.recycled.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(&ConduitConfig::default())
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A fixed-capacity buffer borrowed from a [`BufferPool`].
///
/// Bytes are written into [`spare_mut`](Self::spare_mut) and made readable
/// with [`commit`](Self::commit); the readable region `position..limit` is
/// consumed through the [`Buf`] implementation.
///
/// When dropped, the buffer goes back to its pool, so every exit path
/// releases it exactly once. [`discard`](Pooled::discard) destroys it instead.
pub struct PooledBuffer {
    data: Box<[u8]>,
    position: usize,
    limit: usize,
    discard: bool,
    /// `Weak::new()` once the pool is gone or for detached buffers.
    pool: Weak<PoolInner>,
}

impl PooledBuffer {
    /// Creates a buffer that belongs to no pool. Releasing it just deallocates.
    pub fn detached(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            position: 0,
            limit: 0,
            discard: false,
            pool: Weak::new(),
        }
    }

    /// Returns the fixed capacity of the buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Returns the read cursor.
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Returns the end of the readable region.
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Returns every byte written so far, including already consumed ones.
    ///
    /// Offsets into this slice are the absolute positions reported by
    /// [`position`](Self::position).
    #[inline]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.limit]
    }

    /// Returns the writable tail of the buffer.
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.limit..]
    }

    /// Marks `n` bytes of the writable tail as readable.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the writable tail.
    #[inline]
    pub fn commit(&mut self, n: usize) {
        assert!(
            n <= self.data.len() - self.limit,
            "cannot commit past end of buffer"
        );
        self.limit += n;
    }

    /// Resets the buffer to empty without releasing it.
    #[inline]
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = 0;
    }

    /// Returns whether the buffer came from a pool that is still alive.
    pub fn is_pooled(&self) -> bool {
        self.pool.strong_count() > 0
    }
}

impl Pooled for PooledBuffer {
    type Resource = [u8];

    /// The unread bytes.
    fn resource(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    fn free(self) {
        drop(self);
    }

    fn discard(mut self) {
        self.discard = true;
        drop(self);
    }
}

impl Buf for PooledBuffer {
    #[inline]
    fn remaining(&self) -> usize {
        self.limit - self.position
    }

    #[inline]
    fn chunk(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    #[inline]
    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.limit - self.position,
            "cannot advance past end of buffer"
        );
        self.position += cnt;
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = mem::take(&mut self.data);
        if let Some(pool) = self.pool.upgrade() {
            pool.release(data, self.discard);
        }
        // If pool is gone, buffer is simply dropped (deallocated)
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undersized_config_is_raised() {
        let pool = BufferPool::new(&ConduitConfig::default().with_buffer_size(0));
        assert_eq!(pool.buffer_size(), MIN_BUFFER_SIZE);
        assert_eq!(pool.allocate().capacity(), MIN_BUFFER_SIZE);
    }

    #[test]
    fn test_allocate_and_free() {
        let pool = BufferPool::with_capacity(64, 4);
        let buf = pool.allocate();
        assert_eq!(buf.capacity(), 64);
        assert_eq!(pool.stats().outstanding, 1);

        buf.free();
        let stats = pool.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.recycled, 1);
        assert_eq!(stats.idle, 1);
    }

    #[test]
    fn test_discard_does_not_recycle() {
        let pool = BufferPool::with_capacity(64, 4);
        pool.allocate().discard();

        let stats = pool.stats();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.recycled, 0);
        assert_eq!(stats.idle, 0);
    }

    #[test]
    fn test_drop_returns_to_pool() {
        let pool = BufferPool::with_capacity(64, 4);
        {
            let mut buf = pool.allocate();
            buf.spare_mut()[..4].copy_from_slice(b"test");
            buf.commit(4);
        }
        assert_eq!(pool.stats().idle, 1);

        // Reused buffers start out empty
        let buf = pool.allocate();
        assert_eq!(buf.remaining(), 0);
        assert_eq!(pool.stats().allocations, 2);
    }

    #[test]
    fn test_freelist_is_bounded() {
        let pool = BufferPool::with_capacity(16, 2);
        let buffers: Vec<_> = (0..4).map(|_| pool.allocate()).collect();
        drop(buffers);

        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.recycled, 4);
        assert_eq!(stats.outstanding, 0);
    }

    #[test]
    fn test_commit_and_consume() {
        let mut buf = PooledBuffer::detached(16);
        buf.spare_mut()[..5].copy_from_slice(b"hello");
        buf.commit(5);
        assert_eq!(buf.resource(), b"hello");

        buf.advance(2);
        assert_eq!(buf.chunk(), b"llo");
        assert_eq!(buf.position(), 2);
        assert_eq!(buf.filled(), b"hello");
        assert_eq!(buf.spare_mut().len(), 11);

        buf.clear();
        assert!(!buf.has_remaining());
    }

    #[test]
    #[should_panic(expected = "cannot commit past end of buffer")]
    fn test_commit_overflow_panics() {
        let mut buf = PooledBuffer::detached(4);
        buf.commit(5);
    }

    #[test]
    fn test_buffer_outlives_pool() {
        let pool = BufferPool::with_capacity(16, 2);
        let buf = pool.allocate();
        assert!(buf.is_pooled());
        drop(pool);
        assert!(!buf.is_pooled());
        buf.free();
    }
}
