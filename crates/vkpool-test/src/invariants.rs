//! Structural checks over pools and live allocations.

use hashbrown::HashMap;

use vkpool_alloc::{MemoryAllocation, MemoryAllocator, MemoryPool, PoolId};

use crate::{Result, TestError};

fn violated(message: String) -> TestError {
    TestError::Invariant(message)
}

/// Check that a pool's blocks tile `[0, size)` on block granularity, with no
/// two free blocks adjacent and statistics that agree with the block list.
pub fn check_pool(pool: &MemoryPool) -> Result<()> {
    let blocks = pool.blocks();
    let granularity = pool.block_size();

    let mut cursor = 0;
    let mut previous_free = false;
    let (mut used, mut free) = (0, 0);
    for block in &blocks {
        if block.offset != cursor {
            return Err(violated(format!(
                "{}: block at {} but previous block ended at {cursor}",
                pool.id(),
                block.offset
            )));
        }
        if block.offset % granularity != 0 || block.size % granularity != 0 || block.size == 0 {
            return Err(violated(format!(
                "{}: block {}+{} is not on {granularity}-byte granularity",
                pool.id(),
                block.offset,
                block.size
            )));
        }
        if !block.in_use && previous_free {
            return Err(violated(format!(
                "{}: free block at {} was not coalesced",
                pool.id(),
                block.offset
            )));
        }
        previous_free = !block.in_use;
        if block.in_use {
            used += block.size;
        } else {
            free += block.size;
        }
        cursor = block.end();
    }
    if cursor != pool.size() {
        return Err(violated(format!(
            "{}: blocks cover {cursor} of {} bytes",
            pool.id(),
            pool.size()
        )));
    }

    let stats = pool.stats();
    if stats.used_size != used || stats.free_size != free {
        return Err(violated(format!(
            "{}: stats report {}/{} used/free, blocks sum to {used}/{free}",
            pool.id(),
            stats.used_size,
            stats.free_size
        )));
    }
    Ok(())
}

/// Check the allocator against the caller's view of live allocations.
///
/// Verifies size conservation, that every pooled allocation is exactly one
/// used block of its pool, that no two live allocations overlap, and runs
/// [`check_pool`] on every pool.
pub fn check_allocations(allocator: &MemoryAllocator, live: &[MemoryAllocation]) -> Result<()> {
    let stats = allocator.stats();
    let expected: u64 = live.iter().map(MemoryAllocation::size).sum();
    if stats.total_allocated != expected {
        return Err(violated(format!(
            "total_allocated is {} but live allocations sum to {expected}",
            stats.total_allocated
        )));
    }
    if stats.allocation_count as usize != live.len() {
        return Err(violated(format!(
            "allocator tracks {} allocations, caller holds {}",
            stats.allocation_count,
            live.len()
        )));
    }

    let mut by_pool: HashMap<PoolId, Vec<&MemoryAllocation>> = HashMap::new();
    for allocation in live {
        if !allocator.contains(allocation) {
            return Err(violated(format!("{} is not tracked", allocation.id())));
        }
        if let Some(pool) = allocation.pool() {
            by_pool.entry(pool).or_default().push(allocation);
        }
    }

    for pool in allocator.pools() {
        check_pool(&pool)?;

        let used: HashMap<u64, u64> = pool
            .blocks()
            .into_iter()
            .filter(|block| block.in_use)
            .map(|block| (block.offset, block.size))
            .collect();
        let mut allocations = by_pool.remove(&pool.id()).unwrap_or_default();
        if allocations.len() != used.len() {
            return Err(violated(format!(
                "{} has {} used blocks but {} live allocations",
                pool.id(),
                used.len(),
                allocations.len()
            )));
        }

        allocations.sort_unstable_by_key(|a| a.offset());
        for allocation in &allocations {
            if used.get(&allocation.offset()) != Some(&allocation.size()) {
                return Err(violated(format!(
                    "{} at {}+{} does not match a used block of {}",
                    allocation.id(),
                    allocation.offset(),
                    allocation.size(),
                    pool.id()
                )));
            }
        }
        for pair in allocations.windows(2) {
            if pair[0].offset() + pair[0].size() > pair[1].offset() {
                return Err(violated(format!(
                    "{} overlaps {}",
                    pair[0].id(),
                    pair[1].id()
                )));
            }
        }
    }

    if let Some(pool) = by_pool.keys().next() {
        return Err(violated(format!("live allocations reference missing {pool}")));
    }
    Ok(())
}
