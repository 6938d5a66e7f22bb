//! Error types for the allocator.

use thiserror::Error;

use crate::types::MemoryPropertyFlags;

/// Allocator-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Zero size, malformed alignment or an unusable configuration.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The live-allocation cap has been reached.
    #[error("Too many allocations: limit of {max} reached")]
    TooManyAllocations { max: u32 },

    /// No backend memory type satisfies the required flags under the type mask.
    #[error("No suitable memory type for type bits {type_bits:#x} with required flags {required:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        required: MemoryPropertyFlags,
    },

    /// A specific pool has no free block large enough.
    #[error("Out of pool memory: requested {requested} bytes, largest free block is {largest_free} bytes")]
    OutOfPoolMemory { requested: u64, largest_free: u64 },

    /// The backend refused to reserve an arena or dedicated region.
    #[error("Arena reservation of {size} bytes on memory type {type_index} failed: {source}")]
    ArenaReservationFailed {
        type_index: u32,
        size: u64,
        #[source]
        source: BackendError,
    },

    /// Unknown or already-freed allocation.
    #[error("Allocation not found: {0}")]
    AllocationNotFound(String),

    /// Map requested on memory that is not host visible.
    #[error("Memory type {type_index} is not host visible")]
    MemoryNotHostVisible { type_index: u32 },

    /// The backend refused to map an arena.
    #[error("Memory map failed: {0}")]
    MapFailed(#[source] BackendError),

    /// Operation on a destroyed pool or allocator.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Failures reported by a memory backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The device has no memory left for the request.
    #[error("out of device memory")]
    OutOfDeviceMemory,

    /// The host has no memory left for the request.
    #[error("out of host memory")]
    OutOfHostMemory,

    /// The memory type index does not exist on this backend.
    #[error("invalid memory type index {0}")]
    InvalidMemoryType(u32),

    /// The arena handle is not known to this backend.
    #[error("unknown arena handle {0:#x}")]
    UnknownArena(u64),

    /// The arena region could not be mapped.
    #[error("memory map failed")]
    MapFailed,

    /// Any other backend failure.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error only means one pool is full.
    ///
    /// The allocator reacts to this by trying the next pool or creating one.
    pub fn is_out_of_pool_memory(&self) -> bool {
        matches!(self, Self::OutOfPoolMemory { .. })
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
