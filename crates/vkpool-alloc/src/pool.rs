//! A pool of fixed-granularity blocks carved out of one backend arena.
//!
//! Free and used blocks are kept in offset-ordered maps. Allocation is
//! first-fit in address order; freeing merges the returned block with its
//! free neighbours, so the free map never holds two adjacent blocks and the
//! union of all blocks always covers `[0, size)`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use vkpool_core::{checked_align_up, Error, MemoryPropertyFlags, Result};

use crate::backend::{ArenaHandle, HostPtr, MemoryBackend};
use crate::block::MemoryBlock;
use crate::stats::PoolStats;

/// Identity of a pool within its allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId(pub u32);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool #{}", self.0)
    }
}

/// Shared host mapping of the whole arena.
struct PoolMapping {
    base: HostPtr,
    users: u32,
}

struct PoolState {
    /// offset -> size
    free_blocks: BTreeMap<u64, u64>,
    /// offset -> size
    used_blocks: BTreeMap<u64, u64>,
    mapping: Option<PoolMapping>,
    destroyed: bool,
}

impl PoolState {
    fn largest_free_block(&self) -> u64 {
        self.free_blocks.values().copied().max().unwrap_or(0)
    }

    fn out_of_memory(&self, requested: u64) -> Error {
        Error::OutOfPoolMemory {
            requested,
            largest_free: self.largest_free_block(),
        }
    }
}

/// One backend arena and the block bookkeeping layered over it.
///
/// Pools are owned by a [`MemoryAllocator`](crate::MemoryAllocator). Outside
/// this crate they are read-only; blocks change only through the allocator,
/// so its allocation table always agrees with the pool.
///
/// ```compile_fail
/// use std::sync::Arc;
/// use vkpool_alloc::{AllocationCreateInfo, HostBackend, MemoryAllocator};
/// use vkpool_alloc::{MemoryRequirements, MemoryUsage};
///
/// let allocator = MemoryAllocator::with_defaults(Arc::new(HostBackend::desktop()));
/// let info = AllocationCreateInfo::new(MemoryUsage::GpuOnly);
/// let alloc = allocator.allocate(&MemoryRequirements::new(256, 1), &info).unwrap();
/// let pool = allocator.pool(alloc.pool().unwrap()).unwrap();
/// pool.free(alloc.offset()).unwrap();
/// ```
pub struct MemoryPool {
    id: PoolId,
    backend: Arc<dyn MemoryBackend>,
    memory: ArenaHandle,
    size: u64,
    type_index: u32,
    property_flags: MemoryPropertyFlags,
    block_size: u64,
    state: Mutex<PoolState>,
}

impl MemoryPool {
    /// Reserve an arena of `size` bytes (rounded up to `block_size`) on
    /// `type_index` and wrap it as a pool with one free block.
    pub(crate) fn new(
        id: PoolId,
        backend: Arc<dyn MemoryBackend>,
        type_index: u32,
        size: u64,
        block_size: u64,
    ) -> Result<Self> {
        if !block_size.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "block size {block_size} is not a power of two"
            )));
        }
        if size == 0 {
            return Err(Error::InvalidArgument(
                "pool size must be non-zero".to_string(),
            ));
        }
        let size = checked_align_up(size, block_size).ok_or_else(|| {
            Error::InvalidArgument(format!("pool size {size} overflows when aligned"))
        })?;
        let property_flags = backend
            .memory_properties()
            .memory_type(type_index)
            .map(|t| t.property_flags)
            .ok_or_else(|| {
                Error::InvalidArgument(format!("memory type {type_index} does not exist"))
            })?;

        let memory = backend
            .reserve_arena(type_index, size)
            .map_err(|source| Error::ArenaReservationFailed {
                type_index,
                size,
                source,
            })?;

        debug!(
            %id,
            type_index,
            size,
            block_size,
            flags = ?property_flags,
            "created memory pool"
        );

        Ok(Self {
            id,
            backend,
            memory,
            size,
            type_index,
            property_flags,
            block_size,
            state: Mutex::new(PoolState {
                free_blocks: BTreeMap::from([(0, size)]),
                used_blocks: BTreeMap::new(),
                mapping: None,
                destroyed: false,
            }),
        })
    }

    /// Pool identity.
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Backend arena handle.
    pub fn memory(&self) -> ArenaHandle {
        self.memory
    }

    /// Arena size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Backend memory type.
    pub fn type_index(&self) -> u32 {
        self.type_index
    }

    /// Capabilities of the memory type.
    pub fn property_flags(&self) -> MemoryPropertyFlags {
        self.property_flags
    }

    /// Allocation granularity.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Whether [`destroy`](Self::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Carve a block of at least `size` bytes, placed at a multiple of
    /// `alignment`.
    ///
    /// The block size is `size` rounded up to the pool granularity. The first
    /// free block (by offset) that can hold it is split; any head padding
    /// introduced by a coarse alignment stays free.
    pub(crate) fn allocate(&self, size: u64, alignment: u64) -> Result<MemoryBlock> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "allocation size must be non-zero".to_string(),
            ));
        }
        if !alignment.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "alignment {alignment} is not a power of two"
            )));
        }

        let mut state = self.state.lock();
        if state.destroyed {
            return Err(Error::InvalidState(format!("{} is destroyed", self.id)));
        }

        let aligned_size = checked_align_up(size, self.block_size).unwrap_or(u64::MAX);
        if aligned_size > self.size {
            return Err(state.out_of_memory(aligned_size));
        }

        let placement_alignment = alignment.max(self.block_size);
        let found = state.free_blocks.iter().find_map(|(&offset, &len)| {
            let start = checked_align_up(offset, placement_alignment)?;
            let needed = (start - offset).checked_add(aligned_size)?;
            (needed <= len).then_some((offset, len, start))
        });
        let Some((offset, len, start)) = found else {
            return Err(state.out_of_memory(aligned_size));
        };

        state.free_blocks.remove(&offset);
        if start > offset {
            state.free_blocks.insert(offset, start - offset);
        }
        let end = start + aligned_size;
        let tail = offset + len - end;
        if tail > 0 {
            state.free_blocks.insert(end, tail);
        }
        state.used_blocks.insert(start, aligned_size);

        trace!(pool = %self.id, offset = start, size = aligned_size, "allocated block");
        Ok(MemoryBlock::used(start, aligned_size))
    }

    /// Return the used block starting at `offset` and coalesce it with its
    /// free neighbours.
    pub(crate) fn free(&self, offset: u64) -> Result<MemoryBlock> {
        let mut state = self.state.lock();
        let size = state.used_blocks.remove(&offset).ok_or_else(|| {
            Error::AllocationNotFound(format!("no used block at offset {offset} in {}", self.id))
        })?;

        let mut start = offset;
        let mut len = size;

        let left = state
            .free_blocks
            .range(..offset)
            .next_back()
            .map(|(&o, &l)| (o, l));
        if let Some((left_offset, left_len)) = left {
            if left_offset + left_len == offset {
                state.free_blocks.remove(&left_offset);
                start = left_offset;
                len += left_len;
            }
        }
        if let Some(right_len) = state.free_blocks.remove(&(offset + size)) {
            len += right_len;
        }
        state.free_blocks.insert(start, len);

        trace!(
            pool = %self.id,
            offset,
            size,
            merged_offset = start,
            merged_size = len,
            "freed block"
        );
        Ok(MemoryBlock::used(offset, size))
    }

    /// Map the block at `offset` for host access.
    ///
    /// The whole arena is mapped once and shared by all mapped blocks; it is
    /// unmapped when the last of them calls `unmap`.
    pub(crate) fn map(&self, offset: u64) -> Result<HostPtr> {
        if !self
            .property_flags
            .contains(MemoryPropertyFlags::HOST_VISIBLE)
        {
            return Err(Error::MemoryNotHostVisible {
                type_index: self.type_index,
            });
        }

        let mut state = self.state.lock();
        if state.destroyed {
            return Err(Error::InvalidState(format!("{} is destroyed", self.id)));
        }
        if !state.used_blocks.contains_key(&offset) {
            return Err(Error::AllocationNotFound(format!(
                "no used block at offset {offset} in {}",
                self.id
            )));
        }

        let base = match state.mapping.as_mut() {
            Some(mapping) => {
                mapping.users += 1;
                mapping.base
            }
            None => {
                let base = self
                    .backend
                    .map_arena_region(self.memory, 0, self.size)
                    .map_err(Error::MapFailed)?;
                state.mapping = Some(PoolMapping { base, users: 1 });
                trace!(pool = %self.id, "mapped arena");
                base
            }
        };

        // SAFETY: offset names a used block, which lies inside the arena.
        Ok(unsafe { base.add(offset) })
    }

    /// Release one mapping taken with `map`.
    pub(crate) fn unmap(&self) {
        let mut state = self.state.lock();
        let Some(mapping) = state.mapping.as_mut() else {
            return;
        };
        mapping.users -= 1;
        if mapping.users == 0 {
            state.mapping = None;
            self.backend.unmap_arena_region(self.memory);
            trace!(pool = %self.id, "unmapped arena");
        }
    }

    /// Number of outstanding mappings of the arena.
    pub fn map_count(&self) -> u32 {
        self.state.lock().mapping.as_ref().map_or(0, |m| m.users)
    }

    /// Consistent utilization snapshot.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let used_size: u64 = state.used_blocks.values().sum();
        let free_size: u64 = state.free_blocks.values().sum();

        PoolStats {
            id: self.id,
            total_size: self.size,
            used_size,
            free_size,
            block_count: (state.used_blocks.len() + state.free_blocks.len()) as u32,
            allocation_count: state.used_blocks.len() as u32,
            free_block_count: state.free_blocks.len() as u32,
            largest_free_block: state.largest_free_block(),
            type_index: self.type_index,
            property_flags: self.property_flags,
        }
    }

    /// All blocks, free and used, ordered by offset.
    pub fn blocks(&self) -> Vec<MemoryBlock> {
        let state = self.state.lock();
        let mut blocks: Vec<MemoryBlock> = state
            .free_blocks
            .iter()
            .map(|(&offset, &size)| MemoryBlock::free(offset, size))
            .chain(
                state
                    .used_blocks
                    .iter()
                    .map(|(&offset, &size)| MemoryBlock::used(offset, size)),
            )
            .collect();
        blocks.sort_unstable_by_key(|block| block.offset);
        blocks
    }

    /// Release the backend arena and clear the block lists.
    ///
    /// Calling this more than once has no further effect.
    pub(crate) fn destroy(&self) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }

        if state.mapping.take().is_some() {
            self.backend.unmap_arena_region(self.memory);
        }
        if !state.used_blocks.is_empty() {
            warn!(
                pool = %self.id,
                blocks = state.used_blocks.len(),
                "destroying pool with blocks still in use"
            );
        }

        self.backend.release_arena(self.memory);
        state.free_blocks.clear();
        state.used_blocks.clear();
        state.destroyed = true;

        debug!(pool = %self.id, size = self.size, "destroyed memory pool");
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("type_index", &self.type_index)
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}
