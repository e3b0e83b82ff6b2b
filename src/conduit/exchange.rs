//! The request exchange a chunked body belongs to.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::config::ConduitConfig;

/// Per-request settings the conduit consults while decoding.
pub trait Exchange {
    /// Returns the maximum number of payload bytes, `0` or negative for unlimited.
    ///
    /// Read once, when the first payload bytes arrive.
    fn max_entity_size(&self) -> i64;

    /// Marks whether the connection may be reused after this request.
    fn set_persistent(&mut self, persistent: bool);
}

struct ExchangeState {
    max_entity_size: AtomicI64,
    persistent: AtomicBool,
}

/// An [`Exchange`] whose clones share state.
///
/// Hand one clone to the conduit and keep another to observe whether the
/// connection is still persistent after decoding.
///
/// # Example
///
/// ```
/// use dechunkrs::{Exchange, SharedExchange};
///
/// let exchange = SharedExchange::new(1024);
/// let mut conduit_side = exchange.clone();
///
/// conduit_side.set_persistent(false);
/// assert!(!exchange.is_persistent());
/// assert_eq!(exchange.max_entity_size(), 1024);
/// ```
#[derive(Clone)]
pub struct SharedExchange {
    inner: Arc<ExchangeState>,
}

impl SharedExchange {
    /// Creates a persistent exchange limited to `max_entity_size` payload bytes.
    pub fn new(max_entity_size: i64) -> Self {
        Self {
            inner: Arc::new(ExchangeState {
                max_entity_size: AtomicI64::new(max_entity_size),
                persistent: AtomicBool::new(true),
            }),
        }
    }

    /// Creates an exchange using the entity limit of `config`.
    pub fn from_config(config: &ConduitConfig) -> Self {
        Self::new(config.max_entity_size().unwrap_or(0))
    }

    /// Changes the entity limit. Conduits that already resolved it are unaffected.
    pub fn set_max_entity_size(&self, max_entity_size: i64) {
        self.inner
            .max_entity_size
            .store(max_entity_size, Ordering::Relaxed);
    }

    /// Returns whether the connection may still be reused.
    pub fn is_persistent(&self) -> bool {
        self.inner.persistent.load(Ordering::Acquire)
    }
}

impl Exchange for SharedExchange {
    fn max_entity_size(&self) -> i64 {
        self.inner.max_entity_size.load(Ordering::Relaxed)
    }

    fn set_persistent(&mut self, persistent: bool) {
        self.inner.persistent.store(persistent, Ordering::Release);
    }
}

impl Default for SharedExchange {
    /// An unlimited, persistent exchange.
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for SharedExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedExchange")
            .field("max_entity_size", &self.max_entity_size())
            .field("persistent", &self.is_persistent())
            .finish()
    }
}
