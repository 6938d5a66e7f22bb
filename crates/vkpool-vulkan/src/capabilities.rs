//! Device memory capability detection.

use std::ffi::CStr;

use ash::vk;
use vkpool_core::constants::MIB;
use vkpool_core::{MemoryProperties, MemoryPropertyFlags};

use crate::backend::memory_properties_from_vk;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Memory-related capabilities of a physical device.
#[derive(Debug, Clone)]
pub struct MemoryCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Maximum number of live `VkDeviceMemory` objects
    pub max_memory_allocation_count: u32,
    /// Granularity at which linear and optimal resources may share memory
    pub buffer_image_granularity: u64,
    /// Alignment for flushing non-coherent mappings
    pub non_coherent_atom_size: u64,
    /// The memory-type table in allocator form
    pub memory_properties: MemoryProperties,
}

impl MemoryCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        // SAFETY: the caller guarantees valid handles.
        let (properties, memory) = unsafe {
            (
                instance.get_physical_device_properties(physical_device),
                instance.get_physical_device_memory_properties(physical_device),
            )
        };

        // SAFETY: device_name is a NUL-terminated fixed array filled by the driver.
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let memory_properties = memory_properties_from_vk(&memory);

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            api_version: properties.api_version,
            device_local_memory_mb: memory_properties.device_local_bytes() / MIB,
            max_memory_allocation_count: properties.limits.max_memory_allocation_count,
            buffer_image_granularity: properties.limits.buffer_image_granularity,
            non_coherent_atom_size: properties.limits.non_coherent_atom_size,
            memory_properties,
        }
    }

    /// Whether any memory type can be mapped by the host.
    pub fn has_host_visible_memory(&self) -> bool {
        self.memory_properties
            .types()
            .iter()
            .any(|t| t.property_flags.contains(MemoryPropertyFlags::HOST_VISIBLE))
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - {} memory types - {} max allocations",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            self.memory_properties.types().len(),
            self.max_memory_allocation_count,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vkpool_core::{MemoryHeap, MemoryType};

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn summary_mentions_device_and_limits() {
        let caps = MemoryCapabilities {
            vendor: GpuVendor::Amd,
            device_name: "Test GPU".to_string(),
            api_version: vk::make_api_version(0, 1, 3, 250),
            device_local_memory_mb: 8192,
            max_memory_allocation_count: 4096,
            buffer_image_granularity: 1024,
            non_coherent_atom_size: 64,
            memory_properties: MemoryProperties::new(
                vec![MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                }],
                vec![MemoryHeap {
                    size: 8192 * MIB,
                    device_local: true,
                }],
            ),
        };

        let summary = caps.summary();
        assert!(summary.contains("Test GPU"));
        assert!(summary.contains("Vulkan 1.3.250"));
        assert!(summary.contains("8192 MB VRAM"));
        assert!(!caps.has_host_visible_memory());
    }
}
