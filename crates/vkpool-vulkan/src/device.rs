//! Headless device management.

use std::sync::Arc;

use ash::vk;
use tracing::{info, warn};

use crate::backend::VulkanBackend;
use crate::capabilities::MemoryCapabilities;
use crate::error::{Result, VulkanError};
use crate::instance::{create_instance, select_physical_device};

/// A Vulkan device with no surface, owning the memory backend built on it.
pub struct HeadlessDevice {
    // Entry must be kept alive for the lifetime of the instance
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    capabilities: MemoryCapabilities,
    backend: Arc<VulkanBackend>,
    queue_family: u32,
    queue: vk::Queue,
}

impl HeadlessDevice {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get memory capabilities.
    pub fn capabilities(&self) -> &MemoryCapabilities {
        &self.capabilities
    }

    /// Get the memory backend for this device.
    pub fn backend(&self) -> Arc<VulkanBackend> {
        self.backend.clone()
    }

    /// Get the queue family index of [`queue`](Self::queue).
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Get the device queue.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        // SAFETY: the device is alive for the lifetime of self.
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for HeadlessDevice {
    fn drop(&mut self) {
        if Arc::strong_count(&self.backend) > 1 {
            warn!("memory backend outlives its device; freeing its arenas now");
        }
        // SAFETY: the backend frees all device memory and stops using the
        // device before it is destroyed, and the instance is destroyed last.
        unsafe {
            let _ = self.device.device_wait_idle();
            self.backend.shutdown();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a headless device.
pub struct HeadlessDeviceBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for HeadlessDeviceBuilder {
    fn default() -> Self {
        Self {
            app_name: "vkpool".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl HeadlessDeviceBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the device.
    pub fn build(self) -> Result<HeadlessDevice> {
        // SAFETY: loading the system Vulkan library has no preconditions
        // beyond the library itself being well formed.
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| VulkanError::Loading(e.to_string()))?;

        // SAFETY: entry was just loaded.
        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        // SAFETY: instance is valid until destroyed below or by HeadlessDevice.
        let setup = unsafe { create_device(&instance) };
        let (physical_device, device, queue_family, queue) = match setup {
            Ok(parts) => parts,
            Err(err) => {
                // SAFETY: nothing created from the instance survives.
                unsafe { instance.destroy_instance(None) };
                return Err(err);
            }
        };

        // SAFETY: handles are valid and belong together.
        let capabilities = unsafe { MemoryCapabilities::query(&instance, physical_device) };
        info!("Selected GPU: {}", capabilities.summary());

        let device = Arc::new(device);
        // SAFETY: HeadlessDevice frees the backend's arenas before destroying
        // the device.
        let backend =
            Arc::new(unsafe { VulkanBackend::new(&instance, physical_device, device.clone()) });

        Ok(HeadlessDevice {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            backend,
            queue_family,
            queue,
        })
    }
}

/// Pick a physical device and create a logical device with one queue.
///
/// # Safety
/// The instance must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
) -> Result<(vk::PhysicalDevice, ash::Device, u32, vk::Queue)> {
    // SAFETY: the caller guarantees a valid instance.
    let physical_device = unsafe { select_physical_device(instance) }?;
    // SAFETY: physical_device was enumerated from instance.
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    // Any queue works for memory operations; prefer transfer-capable ones.
    let queue_family = families
        .iter()
        .position(|f| f.queue_flags.contains(vk::QueueFlags::TRANSFER))
        .or_else(|| families.iter().position(|f| f.queue_count > 0))
        .ok_or(VulkanError::NoSuitableDevice)? as u32;

    let queue_priority = 1.0_f32;
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority));
    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_create_info));

    // SAFETY: create info pointers outlive the call.
    let device = unsafe { instance.create_device(physical_device, &device_create_info, None)? };
    // SAFETY: queue 0 of queue_family was requested above.
    let queue = unsafe { device.get_device_queue(queue_family, 0) };

    Ok((physical_device, device, queue_family, queue))
}
