//! Allocator configuration.

use serde::{Deserialize, Serialize};
use vkpool_core::constants::{
    DEFAULT_BLOCK_SIZE, DEFAULT_DEDICATED_THRESHOLD, DEFAULT_MAX_ALLOCATIONS, DEFAULT_POOL_SIZE,
};
use vkpool_core::{Error, Result};

/// Tunables of a [`MemoryAllocator`](crate::MemoryAllocator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Hard cap on simultaneously live allocations.
    pub max_allocations: u32,
    /// Capacity of each automatically created pool.
    pub pool_size: u64,
    /// Allocation granularity inside pools (power of two).
    pub block_size: u64,
    /// Requests strictly larger than this get a dedicated reservation.
    pub dedicated_threshold: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_allocations: DEFAULT_MAX_ALLOCATIONS,
            pool_size: DEFAULT_POOL_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            dedicated_threshold: DEFAULT_DEDICATED_THRESHOLD,
        }
    }
}

impl AllocatorConfig {
    /// Set the live-allocation cap.
    #[must_use]
    pub fn with_max_allocations(mut self, max: u32) -> Self {
        self.max_allocations = max;
        self
    }

    /// Set the capacity of automatically created pools.
    #[must_use]
    pub fn with_pool_size(mut self, bytes: u64) -> Self {
        self.pool_size = bytes;
        self
    }

    /// Set the pool allocation granularity.
    #[must_use]
    pub fn with_block_size(mut self, bytes: u64) -> Self {
        self.block_size = bytes;
        self
    }

    /// Set the dedicated-allocation threshold.
    #[must_use]
    pub fn with_dedicated_threshold(mut self, bytes: u64) -> Self {
        self.dedicated_threshold = bytes;
        self
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_allocations == 0 {
            return Err(Error::InvalidArgument(
                "max_allocations must be non-zero".to_string(),
            ));
        }
        if !self.block_size.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "block size {} is not a power of two",
                self.block_size
            )));
        }
        if self.pool_size < self.block_size {
            return Err(Error::InvalidArgument(format!(
                "pool size {} is smaller than one block of {} bytes",
                self.pool_size, self.block_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AllocatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_allocations, 4096);
        assert_eq!(config.pool_size, 256 * 1024 * 1024);
        assert_eq!(config.block_size, 64 * 1024);
        assert_eq!(config.dedicated_threshold, 64 * 1024 * 1024);
    }

    #[test]
    fn rejects_bad_block_size() {
        let config = AllocatorConfig::default().with_block_size(3000);
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn rejects_pool_smaller_than_block() {
        let config = AllocatorConfig::default()
            .with_block_size(65_536)
            .with_pool_size(4096);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_cap() {
        assert!(AllocatorConfig::default()
            .with_max_allocations(0)
            .validate()
            .is_err());
    }
}
