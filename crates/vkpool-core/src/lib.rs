//! Core types for the vkpool device memory allocator.
//!
//! This crate provides the foundational types shared by the allocator and
//! its backends:
//! - Memory property flags and usage intents
//! - Memory requirements and memory-type tables
//! - Alignment helpers
//! - The allocator error taxonomy

pub mod error;
pub mod math;
pub mod types;

pub use error::{BackendError, Error, Result};
pub use math::{align_down, align_up, checked_align_up, is_aligned};
pub use types::{
    MemoryHeap, MemoryProperties, MemoryPropertyFlags, MemoryRequirements, MemoryType,
    MemoryUsage,
};

/// Allocator-wide constants
pub mod constants {
    /// One kibibyte.
    pub const KIB: u64 = 1024;
    /// One mebibyte.
    pub const MIB: u64 = 1024 * KIB;
    /// Default cap on simultaneously live allocations.
    pub const DEFAULT_MAX_ALLOCATIONS: u32 = 4096;
    /// Default capacity of a freshly created pool.
    pub const DEFAULT_POOL_SIZE: u64 = 256 * MIB;
    /// Default allocation granularity inside a pool.
    pub const DEFAULT_BLOCK_SIZE: u64 = 64 * KIB;
    /// Requests larger than this bypass pooling.
    pub const DEFAULT_DEDICATED_THRESHOLD: u64 = 64 * MIB;
    /// Maximum number of memory types a backend can report.
    pub const MAX_MEMORY_TYPES: usize = 32;
    /// Maximum number of memory heaps a backend can report.
    pub const MAX_MEMORY_HEAPS: usize = 16;
}
