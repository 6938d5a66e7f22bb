//! A backend that emulates device memory in system RAM.
//!
//! Useful for headless runs and tests. Arenas are zero-initialized byte
//! buffers; host-visible types can be mapped and written through.

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{trace, warn};

use vkpool_core::constants::MIB;
use vkpool_core::{
    BackendError, MemoryHeap, MemoryProperties, MemoryPropertyFlags, MemoryType,
};

use crate::backend::{ArenaHandle, HostPtr, MemoryBackend};

/// One emulated arena.
struct HostArena {
    storage: Box<[u8]>,
    type_index: u32,
    mapped: bool,
}

#[derive(Default)]
struct HostState {
    arenas: HashMap<u64, HostArena>,
    next_handle: u64,
    reserved_bytes: u64,
    reservations: u64,
    releases: u64,
    invalid_releases: u64,
}

/// System-RAM implementation of [`MemoryBackend`].
pub struct HostBackend {
    properties: MemoryProperties,
    /// Maximum bytes reserved at once (None for unlimited).
    budget: Option<u64>,
    state: Mutex<HostState>,
}

impl HostBackend {
    /// Create a backend with the given memory-type table.
    pub fn new(properties: MemoryProperties) -> Self {
        Self {
            properties,
            budget: None,
            state: Mutex::new(HostState {
                next_handle: 1,
                ..HostState::default()
            }),
        }
    }

    /// A memory layout resembling a discrete desktop GPU.
    ///
    /// | index | flags |
    /// |---|---|
    /// | 0 | device local |
    /// | 1 | host visible, host coherent |
    /// | 2 | host visible, host coherent, host cached |
    /// | 3 | device local, host visible, host coherent |
    /// | 4 | device local, lazily allocated |
    pub fn desktop() -> Self {
        use MemoryPropertyFlags as F;
        let types = vec![
            MemoryType {
                property_flags: F::DEVICE_LOCAL,
                heap_index: 0,
            },
            MemoryType {
                property_flags: F::HOST_VISIBLE | F::HOST_COHERENT,
                heap_index: 1,
            },
            MemoryType {
                property_flags: F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED,
                heap_index: 1,
            },
            MemoryType {
                property_flags: F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT,
                heap_index: 0,
            },
            MemoryType {
                property_flags: F::DEVICE_LOCAL | F::LAZILY_ALLOCATED,
                heap_index: 0,
            },
        ];
        let heaps = vec![
            MemoryHeap {
                size: 8192 * MIB,
                device_local: true,
            },
            MemoryHeap {
                size: 16384 * MIB,
                device_local: false,
            },
        ];
        Self::new(MemoryProperties::new(types, heaps))
    }

    /// Limit the total bytes that may be reserved at once.
    #[must_use]
    pub fn with_budget(mut self, bytes: u64) -> Self {
        self.budget = Some(bytes);
        self
    }

    /// Number of arenas currently reserved.
    pub fn arena_count(&self) -> usize {
        self.state.lock().arenas.len()
    }

    /// Bytes currently reserved across all arenas.
    pub fn reserved_bytes(&self) -> u64 {
        self.state.lock().reserved_bytes
    }

    /// Number of successful reservations since creation.
    pub fn reservation_count(&self) -> u64 {
        self.state.lock().reservations
    }

    /// Number of successful releases since creation.
    pub fn release_count(&self) -> u64 {
        self.state.lock().releases
    }

    /// Number of releases of handles this backend did not know.
    pub fn invalid_release_count(&self) -> u64 {
        self.state.lock().invalid_releases
    }

    /// Whether an arena is currently mapped.
    pub fn is_mapped(&self, handle: ArenaHandle) -> bool {
        self.state
            .lock()
            .arenas
            .get(&handle.as_raw())
            .is_some_and(|arena| arena.mapped)
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::desktop()
    }
}

impl MemoryBackend for HostBackend {
    fn memory_properties(&self) -> &MemoryProperties {
        &self.properties
    }

    fn reserve_arena(&self, type_index: u32, size: u64) -> Result<ArenaHandle, BackendError> {
        if self.properties.memory_type(type_index).is_none() {
            return Err(BackendError::InvalidMemoryType(type_index));
        }

        let mut state = self.state.lock();
        if let Some(budget) = self.budget {
            if state.reserved_bytes.saturating_add(size) > budget {
                return Err(BackendError::OutOfDeviceMemory);
            }
        }

        let len = usize::try_from(size).map_err(|_| BackendError::OutOfHostMemory)?;
        let storage = vec![0u8; len].into_boxed_slice();

        let raw = state.next_handle;
        state.next_handle += 1;
        state.reserved_bytes += size;
        state.reservations += 1;
        state.arenas.insert(
            raw,
            HostArena {
                storage,
                type_index,
                mapped: false,
            },
        );

        trace!(handle = raw, type_index, size, "reserved host arena");
        Ok(ArenaHandle::from_raw(raw))
    }

    fn release_arena(&self, handle: ArenaHandle) {
        let mut state = self.state.lock();
        match state.arenas.remove(&handle.as_raw()) {
            Some(arena) => {
                state.reserved_bytes -= arena.storage.len() as u64;
                state.releases += 1;
                trace!(handle = handle.as_raw(), "released host arena");
            }
            None => {
                state.invalid_releases += 1;
                warn!(handle = handle.as_raw(), "release of unknown host arena");
            }
        }
    }

    fn map_arena_region(
        &self,
        handle: ArenaHandle,
        offset: u64,
        size: u64,
    ) -> Result<HostPtr, BackendError> {
        let mut state = self.state.lock();
        let arena = state
            .arenas
            .get_mut(&handle.as_raw())
            .ok_or(BackendError::UnknownArena(handle.as_raw()))?;

        let host_visible = self
            .properties
            .property_flags(arena.type_index)
            .contains(MemoryPropertyFlags::HOST_VISIBLE);
        let in_bounds = offset
            .checked_add(size)
            .is_some_and(|end| end <= arena.storage.len() as u64);
        if !host_visible || !in_bounds || arena.mapped {
            return Err(BackendError::MapFailed);
        }

        // Box storage never moves while the arena is alive.
        let ptr = HostPtr::from_raw(arena.storage.as_mut_ptr()).ok_or(BackendError::MapFailed)?;
        arena.mapped = true;
        // SAFETY: offset + size was checked against the arena length above.
        Ok(unsafe { ptr.add(offset) })
    }

    fn unmap_arena_region(&self, handle: ArenaHandle) {
        if let Some(arena) = self.state.lock().arenas.get_mut(&handle.as_raw()) {
            arena.mapped = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_release_track_bytes() {
        let backend = HostBackend::desktop();
        let handle = backend.reserve_arena(1, 4096).unwrap();
        assert_eq!(backend.arena_count(), 1);
        assert_eq!(backend.reserved_bytes(), 4096);

        backend.release_arena(handle);
        assert_eq!(backend.arena_count(), 0);
        assert_eq!(backend.reserved_bytes(), 0);
        assert_eq!(backend.release_count(), 1);

        backend.release_arena(handle);
        assert_eq!(backend.invalid_release_count(), 1);
    }

    #[test]
    fn budget_rejects_oversized_reservation() {
        let backend = HostBackend::desktop().with_budget(8192);
        let _first = backend.reserve_arena(0, 8192).unwrap();
        assert_eq!(
            backend.reserve_arena(0, 1),
            Err(BackendError::OutOfDeviceMemory)
        );
    }

    #[test]
    fn unknown_memory_type_is_rejected() {
        let backend = HostBackend::desktop();
        assert_eq!(
            backend.reserve_arena(31, 64),
            Err(BackendError::InvalidMemoryType(31))
        );
    }

    #[test]
    fn mapping_is_writable_and_exclusive() {
        let backend = HostBackend::desktop();
        let handle = backend.reserve_arena(1, 256).unwrap();

        let ptr = backend.map_arena_region(handle, 16, 32).unwrap();
        unsafe { ptr.as_ptr().write(0xAB) };
        assert!(backend.is_mapped(handle));
        assert_eq!(
            backend.map_arena_region(handle, 0, 256),
            Err(BackendError::MapFailed)
        );

        backend.unmap_arena_region(handle);
        let base = backend.map_arena_region(handle, 0, 256).unwrap();
        assert_eq!(unsafe { base.as_ptr().add(16).read() }, 0xAB);
    }

    #[test]
    fn device_local_memory_cannot_be_mapped() {
        let backend = HostBackend::desktop();
        let handle = backend.reserve_arena(0, 256).unwrap();
        assert_eq!(
            backend.map_arena_region(handle, 0, 256),
            Err(BackendError::MapFailed)
        );
    }
}
