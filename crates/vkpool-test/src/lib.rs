//! Test harness for the vkpool allocator.
//!
//! Provides seeded stress workloads, invariant checkers and a
//! fault-injecting backend.

pub mod faulty;
pub mod harness;
pub mod invariants;

pub use faulty::FaultyBackend;
pub use harness::{StressHarness, StressReport};
pub use invariants::{check_allocations, check_pool};

use thiserror::Error;
use vkpool_core::constants::KIB;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("Allocator error: {0}")]
    Allocator(#[from] vkpool_core::Error),
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Stress workload configuration.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to run.
    pub iterations: u32,
    /// RNG seed; the same seed replays the same workload.
    pub seed: u64,
    /// Largest requested size in bytes.
    pub max_size: u64,
    /// Alignments are drawn from `1 << 0 ..= 1 << max_alignment_shift`.
    pub max_alignment_shift: u32,
    /// Probability that a step frees a live allocation.
    pub free_ratio: f64,
    /// Probability that a fresh host-visible allocation is mapped and written.
    pub map_ratio: f64,
    /// Run the invariant checks after every step rather than only at the end.
    pub check_every_step: bool,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            iterations: 1000,
            seed: 0x5EED,
            max_size: 512 * KIB,
            max_alignment_shift: 12,
            free_ratio: 0.45,
            map_ratio: 0.25,
            check_every_step: true,
        }
    }
}
