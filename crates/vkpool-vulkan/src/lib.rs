//! Vulkan backend for the vkpool allocator.
//!
//! This crate provides:
//! - Headless Vulkan instance and device creation
//! - Device memory capability detection
//! - A `MemoryBackend` over `vkAllocateMemory` / `vkMapMemory`

pub mod backend;
pub mod capabilities;
pub mod device;
pub mod error;
pub mod instance;

pub use backend::{memory_properties_from_vk, VulkanBackend};
pub use capabilities::{GpuVendor, MemoryCapabilities};
pub use device::{HeadlessDevice, HeadlessDeviceBuilder};
pub use error::{Result, VulkanError};
