//! A backend wrapper that injects reservation failures.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use vkpool_alloc::{ArenaHandle, HostPtr, MemoryBackend};
use vkpool_core::{BackendError, MemoryProperties};

/// Forwards to an inner backend but fails every `fail_every`-th reservation
/// with `OutOfDeviceMemory`.
pub struct FaultyBackend {
    inner: Arc<dyn MemoryBackend>,
    fail_every: u64,
    reservations: AtomicU64,
    injected: AtomicU64,
}

impl FaultyBackend {
    /// Wrap `inner`. A `fail_every` of 0 never fails.
    pub fn new(inner: Arc<dyn MemoryBackend>, fail_every: u64) -> Self {
        Self {
            inner,
            fail_every,
            reservations: AtomicU64::new(0),
            injected: AtomicU64::new(0),
        }
    }

    /// Number of failures injected so far.
    pub fn injected_failures(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }
}

impl MemoryBackend for FaultyBackend {
    fn memory_properties(&self) -> &MemoryProperties {
        self.inner.memory_properties()
    }

    fn reserve_arena(&self, type_index: u32, size: u64) -> Result<ArenaHandle, BackendError> {
        let attempt = self.reservations.fetch_add(1, Ordering::Relaxed) + 1;
        if self.fail_every != 0 && attempt % self.fail_every == 0 {
            self.injected.fetch_add(1, Ordering::Relaxed);
            debug!(attempt, type_index, size, "injecting reservation failure");
            return Err(BackendError::OutOfDeviceMemory);
        }
        self.inner.reserve_arena(type_index, size)
    }

    fn release_arena(&self, handle: ArenaHandle) {
        self.inner.release_arena(handle);
    }

    fn map_arena_region(
        &self,
        handle: ArenaHandle,
        offset: u64,
        size: u64,
    ) -> Result<HostPtr, BackendError> {
        self.inner.map_arena_region(handle, offset, size)
    }

    fn unmap_arena_region(&self, handle: ArenaHandle) {
        self.inner.unmap_arena_region(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vkpool_alloc::HostBackend;

    #[test]
    fn fails_every_nth_reservation() {
        let host = Arc::new(HostBackend::desktop());
        let backend = FaultyBackend::new(host.clone(), 3);

        let results: Vec<bool> = (0..6)
            .map(|_| backend.reserve_arena(0, 1024).is_ok())
            .collect();
        assert_eq!(results, [true, true, false, true, true, false]);
        assert_eq!(backend.injected_failures(), 2);
        assert_eq!(host.arena_count(), 4);
    }

    #[test]
    fn zero_never_fails() {
        let backend = FaultyBackend::new(Arc::new(HostBackend::desktop()), 0);
        for _ in 0..10 {
            let handle = backend.reserve_arena(1, 64).unwrap();
            backend.release_arena(handle);
        }
        assert_eq!(backend.injected_failures(), 0);
    }
}
