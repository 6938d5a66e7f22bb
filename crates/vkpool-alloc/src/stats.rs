//! Read-only statistics snapshots.

use serde::Serialize;
use vkpool_core::MemoryPropertyFlags;

use crate::pool::PoolId;

/// Utilization of one pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    /// Pool identity.
    pub id: PoolId,
    /// Arena size in bytes.
    pub total_size: u64,
    /// Bytes in used blocks.
    pub used_size: u64,
    /// Bytes in free blocks.
    pub free_size: u64,
    /// Number of blocks, free and used.
    pub block_count: u32,
    /// Number of used blocks.
    pub allocation_count: u32,
    /// Number of free blocks.
    pub free_block_count: u32,
    /// Size of the largest free block.
    pub largest_free_block: u64,
    /// Backend memory type.
    pub type_index: u32,
    /// Capabilities of the memory type.
    pub property_flags: MemoryPropertyFlags,
}

impl PoolStats {
    /// Share of free memory not reachable by the largest free block (0.0-1.0).
    ///
    /// Zero means all free memory is one contiguous block.
    pub fn fragmentation(&self) -> f64 {
        if self.free_size == 0 {
            return 0.0;
        }
        1.0 - self.largest_free_block as f64 / self.free_size as f64
    }
}

/// Allocator-wide statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocatorStats {
    /// Sum of all live allocation sizes.
    pub total_allocated: u64,
    /// Number of live allocations.
    pub allocation_count: u32,
    /// Number of pools.
    pub pool_count: u32,
    /// Number of live dedicated (unpooled) allocations.
    pub dedicated_count: u32,
    /// Bytes held by dedicated allocations.
    pub dedicated_bytes: u64,
    /// Live-allocation cap.
    pub max_allocations: u32,
    /// Per-pool utilization, in pool creation order.
    pub pools: Vec<PoolStats>,
}

impl AllocatorStats {
    /// Bytes reserved from the backend: all pool arenas plus dedicated regions.
    pub fn reserved_bytes(&self) -> u64 {
        self.pools.iter().map(|p| p.total_size).sum::<u64>() + self.dedicated_bytes
    }

    /// Get a human-readable summary.
    pub fn summary(&self) -> String {
        let mib = |bytes: u64| bytes as f64 / (1024.0 * 1024.0);
        format!(
            "{}/{} allocations, {:.2} MiB allocated, {} pools + {} dedicated, {:.2} MiB reserved",
            self.allocation_count,
            self.max_allocations,
            mib(self.total_allocated),
            self.pool_count,
            self.dedicated_count,
            mib(self.reserved_bytes()),
        )
    }
}
