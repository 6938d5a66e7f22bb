//! The seam between the allocator and the graphics backend.
//!
//! A backend reports its memory-type table and hands out large contiguous
//! arenas. Everything finer grained is bookkeeping done by the allocator.

use std::ptr::NonNull;

use vkpool_core::{BackendError, MemoryProperties, MemoryPropertyFlags};

/// Opaque handle of one backend memory reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaHandle(u64);

impl ArenaHandle {
    /// Wrap a raw backend handle value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw backend handle value.
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// Host-accessible pointer into mapped arena memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPtr(NonNull<u8>);

// SAFETY: HostPtr is an address into backend-owned mapped memory. The
// allocator never dereferences it; callers synchronize their own accesses.
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

impl HostPtr {
    /// Wrap a non-null mapped pointer.
    pub const fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// Wrap a raw pointer, returning `None` if it is null.
    pub fn from_raw(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// The raw pointer.
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Offset the pointer by `offset` bytes.
    ///
    /// # Safety
    /// The result must stay within the same mapped region.
    pub unsafe fn add(self, offset: u64) -> Self {
        // SAFETY: the caller guarantees the offset stays inside the mapping.
        Self(unsafe { self.0.add(offset as usize) })
    }
}

/// Device memory provider consumed by the allocator.
pub trait MemoryBackend: Send + Sync {
    /// The backend's memory types and heaps.
    fn memory_properties(&self) -> &MemoryProperties;

    /// Resolve a memory type index for a type mask and desired flags.
    fn resolve_memory_type(
        &self,
        type_bits: u32,
        required: MemoryPropertyFlags,
        preferred: MemoryPropertyFlags,
    ) -> Option<u32> {
        self.memory_properties()
            .find_memory_type(type_bits, required, preferred)
    }

    /// Reserve a contiguous arena of `size` bytes on `type_index`.
    fn reserve_arena(&self, type_index: u32, size: u64) -> Result<ArenaHandle, BackendError>;

    /// Release an arena. Unknown handles are ignored.
    fn release_arena(&self, handle: ArenaHandle);

    /// Map `[offset, offset + size)` of an arena into host memory.
    ///
    /// At most one mapping per arena may be live at a time.
    fn map_arena_region(
        &self,
        handle: ArenaHandle,
        offset: u64,
        size: u64,
    ) -> Result<HostPtr, BackendError>;

    /// Unmap the arena's current mapping, if any.
    fn unmap_arena_region(&self, handle: ArenaHandle);
}
