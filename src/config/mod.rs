//! Configuration for chunked decoding.
//!
//! [`ConduitConfig`] controls the pooled read buffers, the framing limits of
//! the chunk reader and the default maximum entity size.
//!
//! # Example
//!
//! ```
//! use dechunkrs::ConduitConfig;
//!
//! // Custom buffer size and a 1 MiB entity cap
//! let config = ConduitConfig::new(8192, 32)?
//!     .with_max_entity_size(1024 * 1024);
//!
//! assert_eq!(config.buffer_size(), 8192);
//! # Ok::<(), dechunkrs::ConduitError>(())
//! ```

use crate::error::ConduitError;

/// Default pooled buffer size (16 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Smallest buffer size accepted by [`ConduitConfig::validate`].
pub const MIN_BUFFER_SIZE: usize = 16;

/// Default number of idle buffers retained by a pool.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Default limit on the total size of trailer lines (8 KiB).
pub const DEFAULT_MAX_TRAILER_SIZE: usize = 8 * 1024;

/// Default limit on a single chunk-extension run (1 KiB).
pub const DEFAULT_MAX_EXTENSION_SIZE: usize = 1024;

/// Configuration for the decode path.
///
/// # Limits
///
/// - `buffer_size` - capacity of every pooled raw buffer
/// - `pool_capacity` - how many idle buffers the pool keeps for reuse
/// - `max_entity_size` - payload cap, `0` or negative means unlimited
/// - `max_trailer_size` - total bytes of trailer lines accepted after the last chunk
/// - `max_extension_size` - bytes of `;ext` accepted on one chunk-size line
///
/// # Example
///
/// ```
/// use dechunkrs::ConduitConfig;
///
/// let config = ConduitConfig::default()
///     .with_buffer_size(4096)
///     .with_max_trailer_size(1024);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConduitConfig {
    buffer_size: usize,
    pool_capacity: usize,
    max_entity_size: i64,
    max_trailer_size: usize,
    max_extension_size: usize,
}

impl ConduitConfig {
    /// Creates a new configuration with the given buffer size and pool capacity.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::InvalidConfig`] if:
    /// - `buffer_size` is smaller than [`MIN_BUFFER_SIZE`]
    /// - `pool_capacity` is zero
    pub fn new(buffer_size: usize, pool_capacity: usize) -> Result<Self, ConduitError> {
        let config = Self {
            buffer_size,
            pool_capacity,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Sets the capacity of pooled buffers.
    ///
    /// Note: This does not validate the configuration. Use [`ConduitConfig::validate`]
    /// to check if the configuration is valid.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Sets how many idle buffers a pool keeps.
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Sets the maximum entity size. `0` or a negative value disables the limit.
    ///
    /// # Example
    ///
    /// ```
    /// use dechunkrs::ConduitConfig;
    ///
    /// let config = ConduitConfig::default().with_max_entity_size(5);
    /// assert_eq!(config.max_entity_size(), Some(5));
    ///
    /// let config = ConduitConfig::default().with_max_entity_size(0);
    /// assert_eq!(config.max_entity_size(), None);
    /// ```
    pub fn with_max_entity_size(mut self, size: i64) -> Self {
        self.max_entity_size = size;
        self
    }

    /// Sets the limit on the total size of trailer lines.
    pub fn with_max_trailer_size(mut self, size: usize) -> Self {
        self.max_trailer_size = size;
        self
    }

    /// Sets the limit on a single chunk-extension run.
    pub fn with_max_extension_size(mut self, size: usize) -> Self {
        self.max_extension_size = size;
        self
    }

    /// Returns the pooled buffer capacity.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Returns the number of idle buffers a pool retains.
    pub fn pool_capacity(&self) -> usize {
        self.pool_capacity
    }

    /// Returns the maximum entity size, or `None` if unlimited.
    pub fn max_entity_size(&self) -> Option<i64> {
        (self.max_entity_size > 0).then_some(self.max_entity_size)
    }

    /// Returns the trailer size limit.
    pub fn max_trailer_size(&self) -> usize {
        self.max_trailer_size
    }

    /// Returns the chunk-extension size limit.
    pub fn max_extension_size(&self) -> usize {
        self.max_extension_size
    }

    /// Validates the current configuration.
    ///
    /// # Example
    ///
    /// ```
    /// use dechunkrs::ConduitConfig;
    ///
    /// let config = ConduitConfig::default().with_buffer_size(0);
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConduitError> {
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(ConduitError::InvalidConfig {
                message: "buffer_size is below the minimum of 16 bytes",
            });
        }

        if self.pool_capacity == 0 {
            return Err(ConduitError::InvalidConfig {
                message: "pool_capacity must be non-zero",
            });
        }

        if self.max_trailer_size == 0 {
            return Err(ConduitError::InvalidConfig {
                message: "max_trailer_size must be non-zero",
            });
        }

        if self.max_extension_size == 0 {
            return Err(ConduitError::InvalidConfig {
                message: "max_extension_size must be non-zero",
            });
        }

        Ok(())
    }
}

impl Default for ConduitConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            max_entity_size: 0,
            max_trailer_size: DEFAULT_MAX_TRAILER_SIZE,
            max_extension_size: DEFAULT_MAX_EXTENSION_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConduitConfig::default();
        assert_eq!(config.buffer_size(), DEFAULT_BUFFER_SIZE);
        assert_eq!(config.pool_capacity(), DEFAULT_POOL_CAPACITY);
        assert_eq!(config.max_entity_size(), None);
        assert_eq!(config.max_trailer_size(), DEFAULT_MAX_TRAILER_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = ConduitConfig::default()
            .with_buffer_size(1024)
            .with_pool_capacity(4)
            .with_max_entity_size(100)
            .with_max_trailer_size(256)
            .with_max_extension_size(32);

        assert_eq!(config.buffer_size(), 1024);
        assert_eq!(config.pool_capacity(), 4);
        assert_eq!(config.max_entity_size(), Some(100));
        assert_eq!(config.max_trailer_size(), 256);
        assert_eq!(config.max_extension_size(), 32);
    }

    #[test]
    fn test_negative_entity_size_is_unlimited() {
        let config = ConduitConfig::default().with_max_entity_size(-1);
        assert_eq!(config.max_entity_size(), None);
    }

    #[test]
    fn test_invalid_config_small_buffer() {
        assert!(ConduitConfig::new(MIN_BUFFER_SIZE - 1, 4).is_err());
        assert!(ConduitConfig::new(MIN_BUFFER_SIZE, 4).is_ok());
    }

    #[test]
    fn test_invalid_config_zero_pool() {
        let result = ConduitConfig::new(4096, 0);
        assert!(matches!(result, Err(ConduitError::InvalidConfig { .. })));
    }

    #[test]
    fn test_invalid_config_zero_limits() {
        assert!(ConduitConfig::default().with_max_trailer_size(0).validate().is_err());
        assert!(ConduitConfig::default().with_max_extension_size(0).validate().is_err());
    }
}
