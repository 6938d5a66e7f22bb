//! Top-level allocator: memory-type resolution, pool routing and the
//! allocation table.
//!
//! Lock order is always allocator state, then at most one pool at a time.
//! Pools never call back into the allocator.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use vkpool_core::{checked_align_up, Error, MemoryRequirements, Result};

use crate::allocation::{AllocationCreateInfo, AllocationId, MemoryAllocation};
use crate::backend::{HostPtr, MemoryBackend};
use crate::block::MemoryBlock;
use crate::config::AllocatorConfig;
use crate::pool::{MemoryPool, PoolId};
use crate::stats::AllocatorStats;

/// Authoritative state of one live allocation.
struct AllocationRecord {
    allocation: MemoryAllocation,
    mapped: Option<HostPtr>,
}

struct AllocatorState {
    allocations: HashMap<AllocationId, AllocationRecord>,
    pools: Vec<Arc<MemoryPool>>,
    total_allocated: u64,
    next_pool_id: u32,
    destroyed: bool,
}

/// Find the live record for `allocation`.
///
/// Ids are unique per process, and the whole handle must match, so handles
/// from another allocator or from a freed allocation are never resolved.
fn find_record<'a>(
    allocations: &'a mut HashMap<AllocationId, AllocationRecord>,
    allocation: &MemoryAllocation,
) -> Result<&'a mut AllocationRecord> {
    allocations
        .get_mut(&allocation.id())
        .filter(|record| record.allocation == *allocation)
        .ok_or_else(|| Error::AllocationNotFound(allocation.id().to_string()))
}

impl AllocatorState {
    fn pool(&self, id: PoolId) -> Option<&Arc<MemoryPool>> {
        self.pools.iter().find(|pool| pool.id() == id)
    }

    fn is_live(&self, allocation: &MemoryAllocation) -> bool {
        self.allocations
            .get(&allocation.id())
            .is_some_and(|record| record.allocation == *allocation)
    }

    fn register(
        &mut self,
        build: impl FnOnce(AllocationId) -> MemoryAllocation,
    ) -> MemoryAllocation {
        let id = AllocationId::next();
        let allocation = build(id);
        self.total_allocated += allocation.size;
        self.allocations.insert(
            id,
            AllocationRecord {
                allocation,
                mapped: None,
            },
        );

        trace!(%id, size = allocation.size, pool = ?allocation.pool, "registered allocation");
        allocation
    }

    fn register_pooled(
        &mut self,
        pool: &MemoryPool,
        block: MemoryBlock,
        user_data: u64,
    ) -> MemoryAllocation {
        self.register(|id| MemoryAllocation {
            id,
            memory: pool.memory(),
            offset: block.offset,
            size: block.size,
            type_index: pool.type_index(),
            property_flags: pool.property_flags(),
            pool: Some(pool.id()),
            user_data,
        })
    }
}

/// Pool-based device memory allocator.
///
/// All operations are synchronous and safe to call from any thread.
pub struct MemoryAllocator {
    backend: Arc<dyn MemoryBackend>,
    config: AllocatorConfig,
    state: RwLock<AllocatorState>,
}

impl MemoryAllocator {
    /// Create an allocator over a backend.
    pub fn new(backend: Arc<dyn MemoryBackend>, config: AllocatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(backend, config))
    }

    /// Create an allocator with the default configuration.
    pub fn with_defaults(backend: Arc<dyn MemoryBackend>) -> Self {
        Self::from_parts(backend, AllocatorConfig::default())
    }

    fn from_parts(backend: Arc<dyn MemoryBackend>, config: AllocatorConfig) -> Self {
        Self {
            backend,
            config,
            state: RwLock::new(AllocatorState {
                allocations: HashMap::new(),
                pools: Vec::new(),
                total_allocated: 0,
                next_pool_id: 0,
                destroyed: false,
            }),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// The backend this allocator draws arenas from.
    pub fn backend(&self) -> &Arc<dyn MemoryBackend> {
        &self.backend
    }

    /// Allocate memory for `requirements`.
    ///
    /// Routing order: the explicit pool in `create_info` (if any), existing
    /// pools of the resolved memory type, a dedicated reservation for large
    /// requests, and finally a new pool.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all, fields(size = requirements.size))
    )]
    pub fn allocate(
        &self,
        requirements: &MemoryRequirements,
        create_info: &AllocationCreateInfo,
    ) -> Result<MemoryAllocation> {
        requirements.validate()?;

        let mut state = self.state.write();
        if state.destroyed {
            return Err(Error::InvalidState("allocator is destroyed".to_string()));
        }
        if state.allocations.len() >= self.config.max_allocations as usize {
            return Err(Error::TooManyAllocations {
                max: self.config.max_allocations,
            });
        }

        if let Some(pool_id) = create_info.pool {
            match state.pool(pool_id).cloned() {
                Some(pool) => match pool.allocate(requirements.size, requirements.alignment) {
                    Ok(block) => {
                        return Ok(state.register_pooled(&pool, block, create_info.user_data));
                    }
                    Err(err) => {
                        debug!(%pool_id, %err, "explicit pool cannot serve request, falling back");
                    }
                },
                None => debug!(%pool_id, "explicit pool does not exist, falling back"),
            }
        }

        let (required, preferred) = create_info.flags();
        let type_index = self
            .backend
            .resolve_memory_type(requirements.memory_type_bits, required, preferred)
            .ok_or(Error::NoSuitableMemoryType {
                type_bits: requirements.memory_type_bits,
                required,
            })?;

        let candidates: Vec<Arc<MemoryPool>> = state
            .pools
            .iter()
            .filter(|pool| pool.type_index() == type_index)
            .cloned()
            .collect();
        for pool in candidates {
            match pool.allocate(requirements.size, requirements.alignment) {
                Ok(block) => return Ok(state.register_pooled(&pool, block, create_info.user_data)),
                Err(err) if err.is_out_of_pool_memory() => continue,
                Err(err) => return Err(err),
            }
        }

        if requirements.size > self.config.dedicated_threshold {
            return self.allocate_dedicated(
                &mut state,
                type_index,
                requirements.size,
                create_info.user_data,
            );
        }

        // A pool must at least hold the request even when the threshold
        // exceeds the configured pool size.
        let pool_size = checked_align_up(requirements.size, self.config.block_size)
            .map_or(self.config.pool_size, |needed| needed.max(self.config.pool_size));
        let pool = self.create_pool_locked(&mut state, type_index, pool_size)?;
        let block = pool.allocate(requirements.size, requirements.alignment)?;
        Ok(state.register_pooled(&pool, block, create_info.user_data))
    }

    fn allocate_dedicated(
        &self,
        state: &mut AllocatorState,
        type_index: u32,
        size: u64,
        user_data: u64,
    ) -> Result<MemoryAllocation> {
        let memory = self
            .backend
            .reserve_arena(type_index, size)
            .map_err(|source| Error::ArenaReservationFailed {
                type_index,
                size,
                source,
            })?;
        let property_flags = self.backend.memory_properties().property_flags(type_index);

        debug!(type_index, size, "created dedicated allocation");
        Ok(state.register(|id| MemoryAllocation {
            id,
            memory,
            offset: 0,
            size,
            type_index,
            property_flags,
            pool: None,
            user_data,
        }))
    }

    fn create_pool_locked(
        &self,
        state: &mut AllocatorState,
        type_index: u32,
        size: u64,
    ) -> Result<Arc<MemoryPool>> {
        let id = PoolId(state.next_pool_id);
        let pool = Arc::new(MemoryPool::new(
            id,
            self.backend.clone(),
            type_index,
            size,
            self.config.block_size,
        )?);
        state.next_pool_id += 1;
        state.pools.push(pool.clone());
        Ok(pool)
    }

    /// Create a pool of `size` bytes for the memory type that `requirements`
    /// and `create_info` resolve to.
    ///
    /// The returned id can be passed as [`AllocationCreateInfo::pool`].
    pub fn create_pool(
        &self,
        requirements: &MemoryRequirements,
        create_info: &AllocationCreateInfo,
        size: u64,
    ) -> Result<PoolId> {
        let (required, preferred) = create_info.flags();
        let type_index = self
            .backend
            .resolve_memory_type(requirements.memory_type_bits, required, preferred)
            .ok_or(Error::NoSuitableMemoryType {
                type_bits: requirements.memory_type_bits,
                required,
            })?;

        let mut state = self.state.write();
        if state.destroyed {
            return Err(Error::InvalidState("allocator is destroyed".to_string()));
        }
        let pool = self.create_pool_locked(&mut state, type_index, size)?;
        Ok(pool.id())
    }

    /// Free an allocation.
    ///
    /// Unmaps it first if mapped. Freeing an unknown, foreign or
    /// already-freed allocation fails with `AllocationNotFound`.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn free(&self, allocation: &MemoryAllocation) -> Result<()> {
        let mut state = self.state.write();
        find_record(&mut state.allocations, allocation)?;
        let record = state
            .allocations
            .remove(&allocation.id())
            .ok_or_else(|| Error::AllocationNotFound(allocation.id().to_string()))?;
        state.total_allocated -= record.allocation.size;

        self.release_record(&state, record)
    }

    fn release_record(&self, state: &AllocatorState, mut record: AllocationRecord) -> Result<()> {
        let allocation = record.allocation;
        self.unmap_record(state, &mut record);

        match allocation.pool {
            Some(pool_id) => {
                let pool = state.pool(pool_id).ok_or_else(|| {
                    Error::InvalidState(format!("{pool_id} of {} is gone", allocation.id))
                })?;
                pool.free(allocation.offset)?;
            }
            None => {
                self.backend.release_arena(allocation.memory);
                debug!(
                    id = %allocation.id,
                    size = allocation.size,
                    "released dedicated allocation"
                );
            }
        }
        Ok(())
    }

    fn unmap_record(&self, state: &AllocatorState, record: &mut AllocationRecord) {
        if record.mapped.take().is_none() {
            return;
        }
        match record.allocation.pool {
            Some(pool_id) => {
                if let Some(pool) = state.pool(pool_id) {
                    pool.unmap();
                }
            }
            None => self.backend.unmap_arena_region(record.allocation.memory),
        }
    }

    /// Map an allocation for host access.
    ///
    /// Mapping an already mapped allocation returns the cached pointer.
    pub fn map(&self, allocation: &MemoryAllocation) -> Result<HostPtr> {
        let mut state = self.state.write();
        let AllocatorState {
            allocations, pools, ..
        } = &mut *state;

        let record = find_record(allocations, allocation)?;
        if let Some(ptr) = record.mapped {
            return Ok(ptr);
        }

        let allocation = record.allocation;
        if !allocation.is_host_visible() {
            return Err(Error::MemoryNotHostVisible {
                type_index: allocation.type_index,
            });
        }

        let ptr = match allocation.pool {
            Some(pool_id) => pools
                .iter()
                .find(|pool| pool.id() == pool_id)
                .ok_or_else(|| {
                    Error::InvalidState(format!("{pool_id} of {} is gone", allocation.id))
                })?
                .map(allocation.offset)?,
            None => self
                .backend
                .map_arena_region(allocation.memory, 0, allocation.size)
                .map_err(Error::MapFailed)?,
        };

        record.mapped = Some(ptr);
        Ok(ptr)
    }

    /// Unmap an allocation. A no-op if it is not mapped.
    pub fn unmap(&self, allocation: &MemoryAllocation) -> Result<()> {
        let mut state = self.state.write();
        let AllocatorState {
            allocations, pools, ..
        } = &mut *state;

        let record = find_record(allocations, allocation)?;
        if record.mapped.take().is_none() {
            return Ok(());
        }

        match record.allocation.pool {
            Some(pool_id) => {
                if let Some(pool) = pools.iter().find(|pool| pool.id() == pool_id) {
                    pool.unmap();
                }
            }
            None => self.backend.unmap_arena_region(record.allocation.memory),
        }
        Ok(())
    }

    /// The current host pointer of an allocation, if mapped.
    pub fn mapped_ptr(&self, allocation: &MemoryAllocation) -> Option<HostPtr> {
        let state = self.state.read();
        state
            .allocations
            .get(&allocation.id())
            .filter(|record| record.allocation == *allocation)
            .and_then(|record| record.mapped)
    }

    /// Whether the allocation is live in this allocator.
    pub fn contains(&self, allocation: &MemoryAllocation) -> bool {
        self.state.read().is_live(allocation)
    }

    /// Look up a pool by id.
    pub fn pool(&self, id: PoolId) -> Option<Arc<MemoryPool>> {
        self.state.read().pool(id).cloned()
    }

    /// All pools, in creation order.
    pub fn pools(&self) -> Vec<Arc<MemoryPool>> {
        self.state.read().pools.clone()
    }

    /// Snapshot of allocator-wide and per-pool statistics.
    pub fn stats(&self) -> AllocatorStats {
        let state = self.state.read();

        let (dedicated_count, dedicated_bytes) = state
            .allocations
            .values()
            .filter(|record| record.allocation.is_dedicated())
            .fold((0u32, 0u64), |(count, bytes), record| {
                (count + 1, bytes + record.allocation.size)
            });

        AllocatorStats {
            total_allocated: state.total_allocated,
            allocation_count: state.allocations.len() as u32,
            pool_count: state.pools.len() as u32,
            dedicated_count,
            dedicated_bytes,
            max_allocations: self.config.max_allocations,
            pools: state.pools.iter().map(|pool| pool.stats()).collect(),
        }
    }

    /// Free every live allocation, destroy every pool and release all
    /// backend reservations.
    ///
    /// Live allocations are freed forcibly and reported as leaks. Calling
    /// this more than once has no further effect.
    pub fn destroy(&self) {
        let mut state = self.state.write();
        if state.destroyed {
            return;
        }

        let records: Vec<AllocationRecord> =
            state.allocations.drain().map(|(_, record)| record).collect();
        if !records.is_empty() {
            warn!(
                count = records.len(),
                bytes = state.total_allocated,
                "freeing live allocations at allocator shutdown"
            );
        }
        for record in records {
            let id = record.allocation.id;
            if let Err(err) = self.release_record(&state, record) {
                warn!(%id, %err, "failed to release allocation during shutdown");
            }
        }
        state.total_allocated = 0;

        let pools = std::mem::take(&mut state.pools);
        let pool_count = pools.len();
        for pool in pools {
            pool.destroy();
        }
        state.destroyed = true;

        info!(pools = pool_count, "memory allocator destroyed");
    }

    /// Whether [`destroy`](Self::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        self.state.read().destroyed
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostBackend;
    use vkpool_core::{MemoryPropertyFlags, MemoryUsage};

    const KIB_64: u64 = 65_536;
    const MIB_1: u64 = 1_048_576;

    fn small_config() -> AllocatorConfig {
        AllocatorConfig::default()
            .with_pool_size(MIB_1)
            .with_block_size(KIB_64)
            .with_dedicated_threshold(MIB_1 / 2)
    }

    fn allocator() -> (Arc<HostBackend>, MemoryAllocator) {
        let backend = Arc::new(HostBackend::desktop());
        let allocator = MemoryAllocator::new(backend.clone(), small_config()).unwrap();
        (backend, allocator)
    }

    fn cpu_only() -> AllocationCreateInfo {
        AllocationCreateInfo::new(MemoryUsage::CpuOnly)
    }

    fn gpu_only() -> AllocationCreateInfo {
        AllocationCreateInfo::new(MemoryUsage::GpuOnly)
    }

    #[test]
    fn rejects_invalid_config() {
        let backend = Arc::new(HostBackend::desktop());
        let config = AllocatorConfig::default().with_block_size(3);
        assert!(matches!(
            MemoryAllocator::new(backend, config),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn total_allocated_tracks_live_sizes() {
        let (_backend, allocator) = allocator();
        let a = allocator
            .allocate(&MemoryRequirements::new(1000, 16), &gpu_only())
            .unwrap();
        let b = allocator
            .allocate(&MemoryRequirements::new(KIB_64 + 1, 16), &gpu_only())
            .unwrap();

        assert_eq!(a.size(), KIB_64);
        assert_eq!(b.size(), 2 * KIB_64);
        assert_eq!(allocator.stats().total_allocated, 3 * KIB_64);
        assert_eq!(a.pool(), b.pool());

        allocator.free(&a).unwrap();
        assert_eq!(allocator.stats().total_allocated, 2 * KIB_64);
        allocator.free(&b).unwrap();

        let stats = allocator.stats();
        assert_eq!(stats.total_allocated, 0);
        assert_eq!(stats.allocation_count, 0);
        assert_eq!(stats.pools[0].free_block_count, 1);
    }

    #[test]
    fn zero_size_is_invalid() {
        let (_backend, allocator) = allocator();
        let err = allocator
            .allocate(&MemoryRequirements::new(0, 1), &gpu_only())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn allocation_cap_is_enforced() {
        let backend = Arc::new(HostBackend::desktop());
        let allocator =
            MemoryAllocator::new(backend, small_config().with_max_allocations(2)).unwrap();
        let req = MemoryRequirements::new(256, 1);

        let a = allocator.allocate(&req, &gpu_only()).unwrap();
        let _b = allocator.allocate(&req, &gpu_only()).unwrap();
        let err = allocator.allocate(&req, &gpu_only()).unwrap_err();
        assert!(matches!(err, Error::TooManyAllocations { max: 2 }));

        allocator.free(&a).unwrap();
        allocator.allocate(&req, &gpu_only()).unwrap();
    }

    #[test]
    fn usage_selects_memory_type() {
        let (_backend, allocator) = allocator();
        let req = MemoryRequirements::new(256, 1);

        let gpu = allocator.allocate(&req, &gpu_only()).unwrap();
        assert_eq!(gpu.type_index(), 0);

        let upload = allocator
            .allocate(&req, &AllocationCreateInfo::new(MemoryUsage::CpuToGpu))
            .unwrap();
        assert_eq!(upload.type_index(), 3);

        let readback = allocator
            .allocate(&req, &AllocationCreateInfo::new(MemoryUsage::GpuToCpu))
            .unwrap();
        assert_eq!(readback.type_index(), 2);
        assert!(readback
            .property_flags()
            .contains(MemoryPropertyFlags::HOST_CACHED));

        assert_eq!(allocator.stats().pool_count, 3);
    }

    #[test]
    fn incompatible_type_bits_fail() {
        let (_backend, allocator) = allocator();
        // Only type 0 (device local) is allowed, but host visibility is required.
        let req = MemoryRequirements::new(256, 1).with_memory_type_bits(0b1);
        let err = allocator.allocate(&req, &cpu_only()).unwrap_err();
        assert!(matches!(err, Error::NoSuitableMemoryType { type_bits: 1, .. }));
    }

    #[test]
    fn map_requires_host_visible_memory() {
        let (_backend, allocator) = allocator();
        let alloc = allocator
            .allocate(&MemoryRequirements::new(256, 1), &gpu_only())
            .unwrap();
        let err = allocator.map(&alloc).unwrap_err();
        assert!(matches!(err, Error::MemoryNotHostVisible { type_index: 0 }));
        assert!(allocator.mapped_ptr(&alloc).is_none());
    }

    #[test]
    fn map_write_and_remap() {
        let (_backend, allocator) = allocator();
        let req = MemoryRequirements::new(256, 1);
        let a = allocator.allocate(&req, &cpu_only()).unwrap();
        let b = allocator.allocate(&req, &cpu_only()).unwrap();

        let pa = allocator.map(&a).unwrap();
        let pb = allocator.map(&b).unwrap();
        assert_eq!(allocator.map(&a).unwrap(), pa);
        assert_eq!(pb.as_ptr() as usize - pa.as_ptr() as usize, KIB_64 as usize);

        // SAFETY: both allocations are mapped and at least 256 bytes long.
        unsafe {
            pa.as_ptr().write_bytes(0xAB, 256);
            pb.as_ptr().write_bytes(0xCD, 256);
            assert_eq!(*pa.as_ptr().add(255), 0xAB);
        }

        allocator.unmap(&a).unwrap();
        assert!(allocator.mapped_ptr(&a).is_none());
        // Unmapping twice is a no-op.
        allocator.unmap(&a).unwrap();

        let pool = allocator.pool(a.pool().unwrap()).unwrap();
        assert_eq!(pool.map_count(), 1);

        let again = allocator.map(&a).unwrap();
        assert_eq!(again, pa);
        assert_eq!(pool.map_count(), 2);
    }

    #[test]
    fn free_unmaps_first() {
        let (backend, allocator) = allocator();
        let alloc = allocator
            .allocate(&MemoryRequirements::new(256, 1), &cpu_only())
            .unwrap();
        allocator.map(&alloc).unwrap();
        allocator.free(&alloc).unwrap();

        assert!(!backend.is_mapped(alloc.memory()));
        assert!(matches!(
            allocator.map(&alloc),
            Err(Error::AllocationNotFound(_))
        ));
    }

    #[test]
    fn double_free_is_not_found() {
        let (_backend, allocator) = allocator();
        let alloc = allocator
            .allocate(&MemoryRequirements::new(256, 1), &gpu_only())
            .unwrap();
        allocator.free(&alloc).unwrap();
        assert!(!allocator.contains(&alloc));

        let err = allocator.free(&alloc).unwrap_err();
        assert!(matches!(err, Error::AllocationNotFound(_)));
        assert_eq!(allocator.stats().total_allocated, 0);
    }

    #[test]
    fn stale_handle_does_not_alias_reused_block() {
        let (_backend, allocator) = allocator();
        let req = MemoryRequirements::new(256, 1);
        let old = allocator.allocate(&req, &gpu_only()).unwrap();
        allocator.free(&old).unwrap();

        let new = allocator.allocate(&req, &gpu_only()).unwrap();
        assert_eq!(new.offset(), old.offset());
        assert_ne!(new.id(), old.id());

        assert!(allocator.free(&old).is_err());
        assert!(allocator.contains(&new));
    }

    #[test]
    fn foreign_handle_is_not_found() {
        let (_backend_a, first) = allocator();
        let (_backend_b, second) = allocator();
        let req = MemoryRequirements::new(256, 1);
        let from_first = first.allocate(&req, &cpu_only()).unwrap();
        let from_second = second.allocate(&req, &cpu_only()).unwrap();
        assert_eq!(from_first.offset(), from_second.offset());
        assert_ne!(from_first.id(), from_second.id());

        assert!(!second.contains(&from_first));
        assert!(matches!(
            second.free(&from_first),
            Err(Error::AllocationNotFound(_))
        ));
        assert!(matches!(
            second.map(&from_first),
            Err(Error::AllocationNotFound(_))
        ));
        assert!(matches!(
            second.unmap(&from_first),
            Err(Error::AllocationNotFound(_))
        ));
        assert!(second.mapped_ptr(&from_first).is_none());

        assert!(second.contains(&from_second));
        assert!(first.contains(&from_first));
        assert_eq!(second.stats().allocation_count, 1);
        second.free(&from_second).unwrap();
        first.free(&from_first).unwrap();
    }

    #[test]
    fn altered_handle_is_not_found() {
        let (_backend, allocator) = allocator();
        let req = MemoryRequirements::new(256, 1);
        let real = allocator.allocate(&req, &cpu_only()).unwrap();
        let altered = MemoryAllocation {
            offset: real.offset() + KIB_64,
            ..real
        };

        assert!(!allocator.contains(&altered));
        assert!(matches!(
            allocator.free(&altered),
            Err(Error::AllocationNotFound(_))
        ));
        assert!(matches!(
            allocator.map(&altered),
            Err(Error::AllocationNotFound(_))
        ));
        assert!(allocator.contains(&real));
        allocator.free(&real).unwrap();
    }

    #[test]
    fn unmap_after_free_is_not_found() {
        let (_backend, allocator) = allocator();
        let alloc = allocator
            .allocate(&MemoryRequirements::new(256, 1), &cpu_only())
            .unwrap();
        allocator.map(&alloc).unwrap();
        allocator.free(&alloc).unwrap();

        assert!(matches!(
            allocator.unmap(&alloc),
            Err(Error::AllocationNotFound(_))
        ));
        assert_eq!(allocator.pools()[0].map_count(), 0);
    }

    #[test]
    fn user_data_is_carried_on_every_path() {
        let (_backend, allocator) = allocator();
        let pooled = allocator
            .allocate(
                &MemoryRequirements::new(256, 1),
                &cpu_only().with_user_data(11),
            )
            .unwrap();
        let dedicated = allocator
            .allocate(
                &MemoryRequirements::new(MIB_1, 1),
                &cpu_only().with_user_data(22),
            )
            .unwrap();
        let untagged = allocator
            .allocate(&MemoryRequirements::new(256, 1), &cpu_only())
            .unwrap();

        assert_eq!(pooled.user_data(), 11);
        assert!(dedicated.is_dedicated());
        assert_eq!(dedicated.user_data(), 22);
        assert_eq!(untagged.user_data(), 0);
    }

    #[test]
    fn pool_introspection_tracks_allocator_bookkeeping() {
        let (_backend, allocator) = allocator();
        let alloc = allocator
            .allocate(&MemoryRequirements::new(256, 1), &gpu_only())
            .unwrap();

        let pool = allocator.pool(alloc.pool().unwrap()).unwrap();
        let used: Vec<_> = pool.blocks().into_iter().filter(|b| b.in_use).collect();
        assert_eq!(used.len(), 1);
        assert_eq!(used[0].offset, alloc.offset());
        assert_eq!(pool.stats().used_size, allocator.stats().total_allocated);

        allocator.free(&alloc).unwrap();
        assert_eq!(pool.stats().used_size, 0);
        assert_eq!(pool.stats().free_block_count, 1);
    }

    #[test]
    fn large_requests_are_dedicated() {
        let (backend, allocator) = allocator();
        let size = MIB_1 / 2 + 1;
        let alloc = allocator
            .allocate(&MemoryRequirements::new(size, 256), &cpu_only())
            .unwrap();

        assert!(alloc.is_dedicated());
        assert_eq!(alloc.offset(), 0);
        assert_eq!(alloc.size(), size);

        let stats = allocator.stats();
        assert_eq!(stats.pool_count, 0);
        assert_eq!(stats.dedicated_count, 1);
        assert_eq!(stats.dedicated_bytes, size);

        let ptr = allocator.map(&alloc).unwrap();
        assert!(backend.is_mapped(alloc.memory()));
        // SAFETY: the whole dedicated allocation is mapped.
        unsafe { ptr.as_ptr().add(size as usize - 1).write(7) };

        allocator.free(&alloc).unwrap();
        assert_eq!(backend.arena_count(), 0);
    }

    #[test]
    fn full_pool_spills_into_new_pool() {
        let (_backend, allocator) = allocator();
        let req = MemoryRequirements::new(MIB_1 / 2, 1);

        let a = allocator.allocate(&req, &gpu_only()).unwrap();
        let b = allocator.allocate(&req, &gpu_only()).unwrap();
        let c = allocator.allocate(&req, &gpu_only()).unwrap();

        assert_eq!(a.pool(), b.pool());
        assert_ne!(a.pool(), c.pool());
        assert_eq!(allocator.stats().pool_count, 2);
    }

    #[test]
    fn explicit_pool_is_preferred() {
        let (_backend, allocator) = allocator();
        let req = MemoryRequirements::new(256, 1);
        let first = allocator.allocate(&req, &gpu_only()).unwrap();

        let pool = allocator.create_pool(&req, &gpu_only(), MIB_1).unwrap();
        assert_ne!(Some(pool), first.pool());

        let alloc = allocator.allocate(&req, &gpu_only().in_pool(pool)).unwrap();
        assert_eq!(alloc.pool(), Some(pool));
    }

    #[test]
    fn explicit_pool_falls_back_when_unusable() {
        let (_backend, allocator) = allocator();
        let req = MemoryRequirements::new(256, 1);
        let pool = allocator.create_pool(&req, &gpu_only(), KIB_64).unwrap();

        let a = allocator.allocate(&req, &gpu_only().in_pool(pool)).unwrap();
        assert_eq!(a.pool(), Some(pool));

        // The explicit pool is full; routing continues to a fresh pool.
        let b = allocator.allocate(&req, &gpu_only().in_pool(pool)).unwrap();
        assert_ne!(b.pool(), Some(pool));

        // Unknown pool ids are ignored.
        let c = allocator
            .allocate(&req, &gpu_only().in_pool(PoolId(99)))
            .unwrap();
        assert!(c.pool().is_some());
    }

    #[test]
    fn reservation_failure_is_reported() {
        let backend = Arc::new(HostBackend::desktop().with_budget(MIB_1));
        let allocator = MemoryAllocator::new(backend, small_config()).unwrap();
        let req = MemoryRequirements::new(MIB_1 / 2, 1);

        allocator.allocate(&req, &gpu_only()).unwrap();
        allocator.allocate(&req, &gpu_only()).unwrap();
        let err = allocator.allocate(&req, &gpu_only()).unwrap_err();
        assert!(matches!(
            err,
            Error::ArenaReservationFailed {
                source: vkpool_core::BackendError::OutOfDeviceMemory,
                ..
            }
        ));
        assert_eq!(allocator.stats().allocation_count, 2);
    }

    #[test]
    fn oversized_pooled_request_gets_a_larger_pool() {
        let backend = Arc::new(HostBackend::desktop());
        let config = small_config().with_dedicated_threshold(4 * MIB_1);
        let allocator = MemoryAllocator::new(backend, config).unwrap();

        let alloc = allocator
            .allocate(&MemoryRequirements::new(2 * MIB_1, 1), &gpu_only())
            .unwrap();
        let pool = allocator.pool(alloc.pool().unwrap()).unwrap();
        assert_eq!(pool.size(), 2 * MIB_1);
    }

    #[test]
    fn destroy_releases_everything() {
        let (backend, allocator) = allocator();
        let req = MemoryRequirements::new(256, 1);
        let a = allocator.allocate(&req, &cpu_only()).unwrap();
        allocator.map(&a).unwrap();
        allocator
            .allocate(&MemoryRequirements::new(MIB_1, 1), &gpu_only())
            .unwrap();

        allocator.destroy();
        assert!(allocator.is_destroyed());
        assert_eq!(backend.arena_count(), 0);
        assert_eq!(backend.invalid_release_count(), 0);

        let stats = allocator.stats();
        assert_eq!(stats.total_allocated, 0);
        assert_eq!(stats.pool_count, 0);

        allocator.destroy();
        assert!(matches!(
            allocator.allocate(&req, &gpu_only()),
            Err(Error::InvalidState(_))
        ));

        drop(allocator);
        assert_eq!(backend.invalid_release_count(), 0);
    }

    #[test]
    fn concurrent_allocate_and_free() {
        let (_backend, allocator) = allocator();
        let allocator = Arc::new(allocator);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    for i in 0..64u64 {
                        let req = MemoryRequirements::new(1 + (i * 977 + t) % 200_000, 256);
                        let alloc = allocator.allocate(&req, &gpu_only()).unwrap();
                        assert_eq!(alloc.offset() % 256, 0);
                        allocator.free(&alloc).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = allocator.stats();
        assert_eq!(stats.total_allocated, 0);
        assert_eq!(stats.allocation_count, 0);
        for pool in &stats.pools {
            assert_eq!(pool.free_block_count, 1);
            assert_eq!(pool.used_size, 0);
        }
    }
}
