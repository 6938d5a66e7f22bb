//! `MemoryBackend` over Vulkan device memory.
//!
//! Every arena is one `VkDeviceMemory`. Arena handles are the raw Vulkan
//! handle values.

use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use hashbrown::HashSet;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use vkpool_alloc::{ArenaHandle, HostPtr, MemoryBackend};
use vkpool_core::constants::{MAX_MEMORY_HEAPS, MAX_MEMORY_TYPES};
use vkpool_core::{BackendError, MemoryHeap, MemoryProperties, MemoryPropertyFlags, MemoryType};

/// Convert the physical device's memory table to allocator form.
pub fn memory_properties_from_vk(memory: &vk::PhysicalDeviceMemoryProperties) -> MemoryProperties {
    let types = memory
        .memory_types
        .iter()
        .take((memory.memory_type_count as usize).min(MAX_MEMORY_TYPES))
        .map(|t| MemoryType {
            property_flags: MemoryPropertyFlags::from_bits_truncate(t.property_flags.as_raw()),
            heap_index: t.heap_index,
        })
        .collect();
    let heaps = memory
        .memory_heaps
        .iter()
        .take((memory.memory_heap_count as usize).min(MAX_MEMORY_HEAPS))
        .map(|h| MemoryHeap {
            size: h.size,
            device_local: h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL),
        })
        .collect();
    MemoryProperties::new(types, heaps)
}

fn backend_error(result: vk::Result) -> BackendError {
    match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => BackendError::OutOfDeviceMemory,
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => BackendError::OutOfHostMemory,
        vk::Result::ERROR_MEMORY_MAP_FAILED => BackendError::MapFailed,
        other => BackendError::Other(other.to_string()),
    }
}

/// Arena bookkeeping shared by every backend call.
#[derive(Default)]
struct BackendState {
    live: HashSet<u64>,
    /// Set once the owning device has been destroyed.
    device_lost: bool,
}

impl BackendState {
    fn ensure_alive(&self) -> Result<(), BackendError> {
        if self.device_lost {
            return Err(BackendError::Other("device has been destroyed".to_string()));
        }
        Ok(())
    }
}

/// Device memory backend.
///
/// The state lock is held across every Vulkan call, so a concurrent
/// [`shutdown`](Self::shutdown) never races an allocation or mapping.
pub struct VulkanBackend {
    device: Arc<ash::Device>,
    properties: MemoryProperties,
    max_allocation_count: u32,
    state: Mutex<BackendState>,
}

impl VulkanBackend {
    /// Create a backend for `device`.
    ///
    /// # Safety
    /// `device` must have been created from `physical_device` on `instance`,
    /// and [`shutdown`](Self::shutdown) must run before the device is
    /// destroyed if the backend can outlive it.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: Arc<ash::Device>,
    ) -> Self {
        // SAFETY: the caller guarantees valid handles.
        let (memory, limits) = unsafe {
            (
                instance.get_physical_device_memory_properties(physical_device),
                instance.get_physical_device_properties(physical_device).limits,
            )
        };

        Self {
            device,
            properties: memory_properties_from_vk(&memory),
            max_allocation_count: limits.max_memory_allocation_count,
            state: Mutex::new(BackendState::default()),
        }
    }

    /// Number of live `VkDeviceMemory` objects owned by this backend.
    pub fn live_arena_count(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_device_lost(&self) -> bool {
        self.state.lock().device_lost
    }

    /// Free every outstanding arena. The backend stays usable.
    pub fn release_all(&self) {
        let mut state = self.state.lock();
        self.free_live(&mut state);
    }

    /// Free every outstanding arena and stop touching the device.
    ///
    /// Afterwards reservations and mappings fail with
    /// [`BackendError::Other`], and releases and unmaps do nothing.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.device_lost {
            return;
        }
        self.free_live(&mut state);
        state.device_lost = true;
        debug!("memory backend shut down");
    }

    fn free_live(&self, state: &mut BackendState) {
        if state.device_lost {
            return;
        }
        if !state.live.is_empty() {
            warn!(count = state.live.len(), "freeing leaked device memory");
        }
        for raw in state.live.drain() {
            // SAFETY: raw came from allocate_memory on this device, the
            // device is still alive, and raw is freed exactly once since it
            // was removed from the live set.
            unsafe {
                self.device
                    .free_memory(vk::DeviceMemory::from_raw(raw), None);
            }
        }
    }
}

impl MemoryBackend for VulkanBackend {
    fn memory_properties(&self) -> &MemoryProperties {
        &self.properties
    }

    fn reserve_arena(&self, type_index: u32, size: u64) -> Result<ArenaHandle, BackendError> {
        if self.properties.memory_type(type_index).is_none() {
            return Err(BackendError::InvalidMemoryType(type_index));
        }

        let mut state = self.state.lock();
        state.ensure_alive()?;
        if state.live.len() >= self.max_allocation_count as usize {
            return Err(BackendError::Other(format!(
                "device allocation limit of {} reached",
                self.max_allocation_count
            )));
        }

        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(type_index);
        // SAFETY: the device is alive while the state lock says so.
        let memory = unsafe { self.device.allocate_memory(&info, None) }.map_err(backend_error)?;

        let raw = memory.as_raw();
        state.live.insert(raw);
        debug!(type_index, size, "allocated device memory");
        Ok(ArenaHandle::from_raw(raw))
    }

    fn release_arena(&self, handle: ArenaHandle) {
        let mut state = self.state.lock();
        if state.device_lost {
            trace!(handle = handle.as_raw(), "release after device shutdown");
            return;
        }
        if !state.live.remove(&handle.as_raw()) {
            warn!(handle = handle.as_raw(), "release of unknown device memory");
            return;
        }
        // SAFETY: the handle was live and is now removed, so it is freed once.
        unsafe {
            self.device
                .free_memory(vk::DeviceMemory::from_raw(handle.as_raw()), None);
        }
        trace!(handle = handle.as_raw(), "freed device memory");
    }

    fn map_arena_region(
        &self,
        handle: ArenaHandle,
        offset: u64,
        size: u64,
    ) -> Result<HostPtr, BackendError> {
        let state = self.state.lock();
        state.ensure_alive()?;
        if !state.live.contains(&handle.as_raw()) {
            return Err(BackendError::UnknownArena(handle.as_raw()));
        }

        // SAFETY: the memory object is live and owned by this device.
        let ptr = unsafe {
            self.device.map_memory(
                vk::DeviceMemory::from_raw(handle.as_raw()),
                offset,
                size,
                vk::MemoryMapFlags::empty(),
            )
        }
        .map_err(backend_error)?;

        HostPtr::from_raw(ptr.cast()).ok_or(BackendError::MapFailed)
    }

    fn unmap_arena_region(&self, handle: ArenaHandle) {
        let state = self.state.lock();
        if state.device_lost || !state.live.contains(&handle.as_raw()) {
            return;
        }
        // SAFETY: the memory object is live; the allocator only unmaps what
        // it mapped.
        unsafe {
            self.device
                .unmap_memory(vk::DeviceMemory::from_raw(handle.as_raw()));
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_memory_table() {
        let mut memory = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            memory_heap_count: 2,
            ..Default::default()
        };
        memory.memory_types[0] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        memory.memory_types[1] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::PROTECTED,
            heap_index: 1,
        };
        memory.memory_heaps[0] = vk::MemoryHeap {
            size: 8 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory.memory_heaps[1] = vk::MemoryHeap {
            size: 16 << 30,
            flags: vk::MemoryHeapFlags::empty(),
        };

        let props = memory_properties_from_vk(&memory);
        assert_eq!(props.types().len(), 2);
        assert_eq!(props.property_flags(0), MemoryPropertyFlags::DEVICE_LOCAL);
        // Flags outside the allocator's set are dropped.
        assert_eq!(
            props.property_flags(1),
            MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT
        );
        assert_eq!(props.device_local_bytes(), 8 << 30);
        assert_eq!(
            props.find_memory_type(
                u32::MAX,
                MemoryPropertyFlags::HOST_VISIBLE,
                MemoryPropertyFlags::empty()
            ),
            Some(1)
        );
    }

    #[test]
    fn lost_device_rejects_new_work() {
        let mut state = BackendState::default();
        assert!(state.ensure_alive().is_ok());

        state.device_lost = true;
        assert!(matches!(state.ensure_alive(), Err(BackendError::Other(_))));
    }

    #[test]
    fn maps_vulkan_errors() {
        assert_eq!(
            backend_error(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            BackendError::OutOfDeviceMemory
        );
        assert_eq!(
            backend_error(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            BackendError::OutOfHostMemory
        );
        assert_eq!(
            backend_error(vk::Result::ERROR_MEMORY_MAP_FAILED),
            BackendError::MapFailed
        );
        assert!(matches!(
            backend_error(vk::Result::ERROR_TOO_MANY_OBJECTS),
            BackendError::Other(_)
        ));
    }
}
