//! Pool-based device memory sub-allocator.
//!
//! This crate provides:
//! - Memory pools with first-fit block allocation and coalescing
//! - A top-level allocator with memory-type resolution and routing
//! - Dedicated allocations for large requests
//! - Host mapping with shared, reference-counted pool mappings
//! - A backend trait plus an in-memory host backend
//! - Allocator and per-pool statistics

pub mod allocation;
pub mod allocator;
pub mod backend;
pub mod block;
pub mod config;
pub mod host;
pub mod pool;
pub mod stats;

pub use allocation::{AllocationCreateInfo, AllocationId, MemoryAllocation};
pub use allocator::MemoryAllocator;
pub use backend::{ArenaHandle, HostPtr, MemoryBackend};
pub use block::MemoryBlock;
pub use config::AllocatorConfig;
pub use host::HostBackend;
pub use pool::{MemoryPool, PoolId};
pub use stats::{AllocatorStats, PoolStats};

pub use vkpool_core::{
    BackendError, Error, MemoryProperties, MemoryPropertyFlags, MemoryRequirements,
    MemoryUsage, Result,
};
