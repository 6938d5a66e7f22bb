//! Vulkan backend error types.

use ash::vk;
use thiserror::Error;

/// Vulkan-related errors.
#[derive(Error, Debug)]
pub enum VulkanError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader could not be found.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Allocator error.
    #[error(transparent)]
    Allocator(#[from] vkpool_core::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, VulkanError>;
