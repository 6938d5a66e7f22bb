//! Memory description types shared between the allocator and its backends.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::constants::MAX_MEMORY_TYPES;
use crate::error::{Error, Result};

bitflags! {
    /// Capability bits of a backend memory type.
    ///
    /// Bit values match `VkMemoryPropertyFlagBits`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct MemoryPropertyFlags: u32 {
        const DEVICE_LOCAL = 0x0000_0001;
        const HOST_VISIBLE = 0x0000_0002;
        const HOST_COHERENT = 0x0000_0004;
        const HOST_CACHED = 0x0000_0008;
        const LAZILY_ALLOCATED = 0x0000_0010;
    }
}

/// How the caller intends to use an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MemoryUsage {
    /// No intent; only explicit flags apply.
    #[default]
    Unknown,
    /// Device-local memory the host never touches.
    GpuOnly,
    /// Host memory, coherent with the device.
    CpuOnly,
    /// Host-written uploads, device-local when possible.
    CpuToGpu,
    /// Device-written readbacks, host-cached when possible.
    GpuToCpu,
    /// Short-lived host staging memory.
    CpuCopy,
    /// Transient attachments backed lazily by the device.
    GpuLazilyAllocated,
}

impl MemoryUsage {
    /// Baseline `(required, preferred)` flags implied by this usage.
    pub fn flags(self) -> (MemoryPropertyFlags, MemoryPropertyFlags) {
        use MemoryPropertyFlags as F;
        match self {
            Self::Unknown => (F::empty(), F::empty()),
            Self::GpuOnly => (F::DEVICE_LOCAL, F::empty()),
            Self::CpuOnly | Self::CpuCopy => (F::HOST_VISIBLE | F::HOST_COHERENT, F::empty()),
            Self::CpuToGpu => (F::HOST_VISIBLE, F::DEVICE_LOCAL),
            Self::GpuToCpu => (F::HOST_VISIBLE, F::HOST_CACHED),
            Self::GpuLazilyAllocated => (F::DEVICE_LOCAL, F::LAZILY_ALLOCATED),
        }
    }
}

/// Size, alignment and compatible memory types of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryRequirements {
    /// Size in bytes.
    pub size: u64,
    /// Required alignment in bytes (power of two).
    pub alignment: u64,
    /// Bit `i` set means memory type `i` may back the resource.
    pub memory_type_bits: u32,
}

impl MemoryRequirements {
    /// Create requirements accepting every memory type.
    pub const fn new(size: u64, alignment: u64) -> Self {
        Self {
            size,
            alignment,
            memory_type_bits: u32::MAX,
        }
    }

    /// Restrict the compatible memory types.
    #[must_use]
    pub const fn with_memory_type_bits(mut self, bits: u32) -> Self {
        self.memory_type_bits = bits;
        self
    }

    /// Reject zero sizes and alignments that are not powers of two.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::InvalidArgument(
                "allocation size must be non-zero".to_string(),
            ));
        }
        if !self.alignment.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "alignment {} is not a power of two",
                self.alignment
            )));
        }
        Ok(())
    }
}

/// One memory type reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryType {
    /// Capabilities of this type.
    pub property_flags: MemoryPropertyFlags,
    /// Heap this type allocates from.
    pub heap_index: u32,
}

/// One memory heap reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryHeap {
    /// Heap size in bytes.
    pub size: u64,
    /// Whether the heap is device local.
    pub device_local: bool,
}

/// The backend's memory-type table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryProperties {
    types: Vec<MemoryType>,
    heaps: Vec<MemoryHeap>,
}

impl MemoryProperties {
    /// Create a table from types and heaps.
    ///
    /// Types beyond the 32 addressable by a type mask are dropped.
    pub fn new(mut types: Vec<MemoryType>, heaps: Vec<MemoryHeap>) -> Self {
        types.truncate(MAX_MEMORY_TYPES);
        Self { types, heaps }
    }

    /// All memory types, indexed by type index.
    pub fn types(&self) -> &[MemoryType] {
        &self.types
    }

    /// All memory heaps.
    pub fn heaps(&self) -> &[MemoryHeap] {
        &self.heaps
    }

    /// Look up a memory type.
    pub fn memory_type(&self, type_index: u32) -> Option<&MemoryType> {
        self.types.get(type_index as usize)
    }

    /// Property flags of a memory type, empty for unknown indices.
    pub fn property_flags(&self, type_index: u32) -> MemoryPropertyFlags {
        self.memory_type(type_index)
            .map(|t| t.property_flags)
            .unwrap_or_default()
    }

    /// Total size of all device-local heaps in bytes.
    pub fn device_local_bytes(&self) -> u64 {
        self.heaps
            .iter()
            .filter(|heap| heap.device_local)
            .map(|heap| heap.size)
            .sum()
    }

    /// Pick a memory type for the given mask and flags.
    ///
    /// The first type allowed by `type_bits` that has both `required` and
    /// `preferred` wins; failing that, the first that has `required`.
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        required: MemoryPropertyFlags,
        preferred: MemoryPropertyFlags,
    ) -> Option<u32> {
        let wanted = required | preferred;
        self.find_with(type_bits, wanted)
            .or_else(|| self.find_with(type_bits, required))
    }

    fn find_with(&self, type_bits: u32, flags: MemoryPropertyFlags) -> Option<u32> {
        self.types
            .iter()
            .enumerate()
            .find(|(i, memory_type)| {
                type_bits & (1 << i) != 0 && memory_type.property_flags.contains(flags)
            })
            .map(|(i, _)| i as u32)
    }
}
