//! Pooled read buffers and their shared-ownership handles.
//!
//! - [`BufferPool`] / [`PooledBuffer`] - fixed-capacity buffers recycled through a shared pool
//! - [`RefCountedPooled`] / [`PooledView`] - one pooled object released by several holders

mod pool;
mod shared;

pub use pool::{BufferPool, PoolStats, Pooled, PooledBuffer};
pub use shared::{BufferSlice, PooledView, RefCountedPooled, SharedBuffer};
