//! Allocation handles and request descriptions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use vkpool_core::{MemoryPropertyFlags, MemoryUsage};

use crate::backend::ArenaHandle;
use crate::pool::PoolId;

/// Stable identity of a live allocation.
///
/// Issued from one process-wide counter, so ids are never reused and
/// never collide between allocators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationId(pub(crate) u64);

static NEXT_ALLOCATION_ID: AtomicU64 = AtomicU64::new(1);

impl AllocationId {
    pub(crate) fn next() -> Self {
        Self(NEXT_ALLOCATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw id value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocation #{}", self.0)
    }
}

/// A live sub-allocation handed out by [`MemoryAllocator`](crate::MemoryAllocator).
///
/// The handle is plain data. The allocator keeps the authoritative record,
/// so every operation on a handle that was already freed fails with
/// `AllocationNotFound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryAllocation {
    pub(crate) id: AllocationId,
    pub(crate) memory: ArenaHandle,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) type_index: u32,
    pub(crate) property_flags: MemoryPropertyFlags,
    pub(crate) pool: Option<PoolId>,
    pub(crate) user_data: u64,
}

impl MemoryAllocation {
    /// Allocation identity.
    pub const fn id(&self) -> AllocationId {
        self.id
    }

    /// Backend arena the allocation lives in.
    pub const fn memory(&self) -> ArenaHandle {
        self.memory
    }

    /// Byte offset within the arena.
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Size in bytes (rounded to the pool granularity for pooled allocations).
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Backend memory type.
    pub const fn type_index(&self) -> u32 {
        self.type_index
    }

    /// Capabilities of the memory type.
    pub const fn property_flags(&self) -> MemoryPropertyFlags {
        self.property_flags
    }

    /// Owning pool, `None` for a dedicated allocation.
    pub const fn pool(&self) -> Option<PoolId> {
        self.pool
    }

    /// Caller tag copied from [`AllocationCreateInfo::user_data`].
    pub const fn user_data(&self) -> u64 {
        self.user_data
    }

    /// Whether the allocation has its own backend reservation.
    pub const fn is_dedicated(&self) -> bool {
        self.pool.is_none()
    }

    /// Whether the allocation can be mapped.
    pub fn is_host_visible(&self) -> bool {
        self.property_flags.contains(MemoryPropertyFlags::HOST_VISIBLE)
    }
}

/// Parameters of an allocation request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationCreateInfo {
    /// Usage intent, translated to baseline flags.
    pub usage: MemoryUsage,
    /// Flags the memory type must have.
    pub required_flags: MemoryPropertyFlags,
    /// Flags the memory type should have when possible.
    pub preferred_flags: MemoryPropertyFlags,
    /// Pool to try first. Falls through to normal routing on failure.
    pub pool: Option<PoolId>,
    /// Opaque tag carried on the resulting allocation.
    pub user_data: u64,
}

impl AllocationCreateInfo {
    /// Create info for a usage intent.
    pub fn new(usage: MemoryUsage) -> Self {
        Self {
            usage,
            ..Self::default()
        }
    }

    /// Add required flags.
    #[must_use]
    pub fn with_required_flags(mut self, flags: MemoryPropertyFlags) -> Self {
        self.required_flags |= flags;
        self
    }

    /// Add preferred flags.
    #[must_use]
    pub fn with_preferred_flags(mut self, flags: MemoryPropertyFlags) -> Self {
        self.preferred_flags |= flags;
        self
    }

    /// Try this pool first.
    #[must_use]
    pub fn in_pool(mut self, pool: PoolId) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Tag the allocation with caller data.
    #[must_use]
    pub fn with_user_data(mut self, user_data: u64) -> Self {
        self.user_data = user_data;
        self
    }

    /// Effective `(required, preferred)` flags: the usage table plus explicit flags.
    pub fn flags(&self) -> (MemoryPropertyFlags, MemoryPropertyFlags) {
        let (required, preferred) = self.usage.flags();
        (
            required | self.required_flags,
            preferred | self.preferred_flags,
        )
    }
}
