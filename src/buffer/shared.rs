//! Reference-counted pooled objects and views over them.
//!
//! A [`RefCountedPooled`] lets several independent holders share one pooled
//! object. Every holder releases its reference with `free()` or `discard()`;
//! the underlying object goes back to its pool (or is destroyed) exactly once,
//! when the last reference is released.
//!
//! # Example
//!
//! ```
//! use std::num::NonZeroUsize;
//! use dechunkrs::{BufferPool, RefCountedPooled};
//!
//! let pool = BufferPool::with_capacity(64, 4);
//! let shared = RefCountedPooled::new(pool.allocate(), NonZeroUsize::new(2).unwrap());
//!
//! shared.free();
//! assert_eq!(pool.stats().outstanding, 1);
//!
//! shared.free();
//! assert_eq!(pool.stats().outstanding, 0);
//! ```

use std::fmt;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::pool::{Pooled, PooledBuffer};
use crate::error::{ConduitError, Result};

struct Shared<P> {
    /// `None` once the final reference has been released.
    underlying: Mutex<Option<P>>,
    count: AtomicUsize,
    discard: AtomicBool,
}

impl<P: Pooled> Shared<P> {
    fn retain(&self) -> Result<()> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                // Only reachable from a holder that no longer owns a reference
                return Err(ConduitError::ObjectWasFreed);
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, discard: bool) {
        if discard {
            self.discard.store(true, Ordering::Release);
        }

        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                log::error!("pooled object released more times than it was referenced");
                return;
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if current == 1 {
            let underlying = self.underlying.lock().take();
            if let Some(underlying) = underlying {
                if self.discard.load(Ordering::Acquire) {
                    underlying.discard();
                } else {
                    underlying.free();
                }
            }
        }
    }

    fn with_underlying<R>(&self, f: impl FnOnce(&P) -> R) -> Result<R> {
        self.underlying
            .lock()
            .as_ref()
            .map(f)
            .ok_or(ConduitError::ObjectWasFreed)
    }
}

/// A pooled object shared by a fixed number of independent holders.
///
/// The count starts at the number of expected holders. Each `free()` or
/// `discard()` gives up one reference. A `discard()` from any holder is
/// sticky: the final release destroys the object even if it is a `free()`.
///
/// Count updates are lock-free compare-and-swap loops. The only lock guards
/// the hand-off of the underlying object at final release.
pub struct RefCountedPooled<P: Pooled> {
    shared: Arc<Shared<P>>,
}

/// A pooled read buffer that may be held by several owners.
pub type SharedBuffer = RefCountedPooled<PooledBuffer>;

/// A view over a byte range of a [`SharedBuffer`].
pub type BufferSlice = PooledView<PooledBuffer, Range<usize>>;

impl<P: Pooled> RefCountedPooled<P> {
    /// Wraps `underlying` with `count` initial references.
    pub fn new(underlying: P, count: NonZeroUsize) -> Self {
        Self {
            shared: Arc::new(Shared {
                underlying: Mutex::new(Some(underlying)),
                count: AtomicUsize::new(count.get()),
                discard: AtomicBool::new(false),
            }),
        }
    }

    /// Takes one more reference on the object.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::ObjectWasFreed`] if every reference was already
    /// released. Callers must hold a live reference when calling this.
    pub fn increase_reference_count(&self) -> Result<()> {
        self.shared.retain()
    }

    /// Creates a handle sharing this object's lifetime that exposes `value`
    /// instead of the underlying resource.
    ///
    /// The view holds its own reference; releasing it (explicitly or by
    /// dropping it) decrements the shared count.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::ObjectWasFreed`] if the object was already released.
    pub fn create_view<T>(&self, value: T) -> Result<PooledView<P, T>> {
        self.shared.retain()?;
        Ok(PooledView {
            shared: Some(Arc::clone(&self.shared)),
            value,
        })
    }

    /// Gives up one reference, recycling the object if it was the last one.
    pub fn free(&self) {
        self.shared.release(false);
    }

    /// Gives up one reference and marks the object for destruction.
    pub fn discard(&self) {
        self.shared.release(true);
    }

    /// Runs `f` against the underlying resource.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::ObjectWasFreed`] after the final release.
    pub fn with_resource<R>(&self, f: impl FnOnce(&P::Resource) -> R) -> Result<R> {
        self.shared.with_underlying(|p| f(p.resource()))
    }

    /// Runs `f` against the underlying pooled object.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::ObjectWasFreed`] after the final release.
    pub fn with_pooled<R>(&self, f: impl FnOnce(&P) -> R) -> Result<R> {
        self.shared.with_underlying(f)
    }

    /// Returns the current number of references.
    pub fn reference_count(&self) -> usize {
        self.shared.count.load(Ordering::Acquire)
    }

    /// Returns whether any holder asked for the object to be discarded.
    pub fn is_discard_requested(&self) -> bool {
        self.shared.discard.load(Ordering::Acquire)
    }

    /// Returns whether the final reference has been released.
    pub fn is_released(&self) -> bool {
        self.reference_count() == 0
    }
}

impl<P: Pooled> From<P> for RefCountedPooled<P> {
    /// Wraps `underlying` with a single reference.
    fn from(underlying: P) -> Self {
        Self::new(underlying, NonZeroUsize::MIN)
    }
}

impl<P: Pooled> fmt::Debug for RefCountedPooled<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCountedPooled")
            .field("reference_count", &self.reference_count())
            .field("discard", &self.is_discard_requested())
            .finish()
    }
}

/// A lightweight handle over a [`RefCountedPooled`] object.
///
/// [`resource`](Self::resource) returns the value chosen when the view was
/// created, not the underlying resource. Dropping an unreleased view frees it.
pub struct PooledView<P: Pooled, T> {
    /// `None` once this view released its reference.
    shared: Option<Arc<Shared<P>>>,
    value: T,
}

impl<P: Pooled, T> PooledView<P, T> {
    /// Returns the value this view exposes.
    pub fn resource(&self) -> &T {
        &self.value
    }

    /// Runs `f` against the underlying pooled object.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::ObjectWasFreed`] if the object is gone.
    pub fn with_pooled<R>(&self, f: impl FnOnce(&P) -> R) -> Result<R> {
        match &self.shared {
            Some(shared) => shared.with_underlying(f),
            None => Err(ConduitError::ObjectWasFreed),
        }
    }

    /// Releases this view's reference.
    pub fn free(mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release(false);
        }
    }

    /// Releases this view's reference and marks the object for destruction.
    pub fn discard(mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release(true);
        }
    }
}

impl PooledView<PooledBuffer, Range<usize>> {
    /// Returns the number of bytes in the viewed range.
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// Returns whether the viewed range is empty.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Runs `f` against the viewed bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::ObjectWasFreed`] if the buffer is gone.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let range = self.value.clone();
        self.with_pooled(|buffer| f(&buffer.filled()[range]))
    }

    /// Copies the viewed bytes into a new vector.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::ObjectWasFreed`] if the buffer is gone.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.with_bytes(<[u8]>::to_vec)
    }
}

impl<P: Pooled, T> Drop for PooledView<P, T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release(false);
        }
    }
}

impl<P: Pooled, T: fmt::Debug> fmt::Debug for PooledView<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledView")
            .field("value", &self.value)
            .field("released", &self.shared.is_none())
            .finish()
    }
}
