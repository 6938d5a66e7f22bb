//! Spans of an arena.

use serde::{Deserialize, Serialize};

/// A contiguous byte span within a pool's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryBlock {
    /// Byte offset within the arena.
    pub offset: u64,
    /// Length in bytes.
    pub size: u64,
    /// Whether the span backs a live allocation.
    pub in_use: bool,
}

impl MemoryBlock {
    /// A free span.
    pub const fn free(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            in_use: false,
        }
    }

    /// A span backing a live allocation.
    pub const fn used(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            in_use: true,
        }
    }

    /// One past the last byte of the span.
    #[inline]
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Whether two spans share at least one byte.
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Whether `other` starts exactly where this span ends, or vice versa.
    pub const fn is_adjacent_to(&self, other: &Self) -> bool {
        self.end() == other.offset || other.end() == self.offset
    }
}
