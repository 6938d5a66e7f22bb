//! Seeded allocate/free/map churn with invariant checking.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use vkpool_alloc::{
    AllocationCreateInfo, AllocatorConfig, AllocatorStats, MemoryAllocation, MemoryAllocator,
    MemoryBackend, MemoryRequirements, MemoryUsage,
};
use vkpool_core::Error;

use crate::invariants::check_allocations;
use crate::{Result, StressConfig, TestError};

const USAGES: [MemoryUsage; 5] = [
    MemoryUsage::GpuOnly,
    MemoryUsage::CpuOnly,
    MemoryUsage::CpuToGpu,
    MemoryUsage::GpuToCpu,
    MemoryUsage::CpuCopy,
];

/// Outcome of a stress run.
#[derive(Debug, Clone, Default)]
pub struct StressReport {
    pub allocations: u64,
    pub frees: u64,
    pub maps: u64,
    /// Allocations refused by the backend or the allocation cap.
    pub failed_allocations: u64,
    pub peak_allocated: u64,
    pub peak_live: usize,
    /// Statistics after the run, before teardown.
    pub final_stats: Option<AllocatorStats>,
}

struct LiveAllocation {
    allocation: MemoryAllocation,
    /// Byte written at both ends of a mapped allocation.
    pattern: Option<u8>,
}

/// Drives a random workload against one allocator.
pub struct StressHarness {
    allocator: MemoryAllocator,
    config: StressConfig,
    rng: StdRng,
    live: Vec<LiveAllocation>,
    report: StressReport,
}

impl StressHarness {
    /// Create a harness over `backend`.
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        allocator_config: AllocatorConfig,
        config: StressConfig,
    ) -> Result<Self> {
        if config.max_size == 0 {
            return Err(Error::InvalidArgument("max_size must be non-zero".to_string()).into());
        }
        if !(0.0..=1.0).contains(&config.free_ratio) || !(0.0..=1.0).contains(&config.map_ratio) {
            return Err(
                Error::InvalidArgument("ratios must lie in [0, 1]".to_string()).into(),
            );
        }

        Ok(Self {
            allocator: MemoryAllocator::new(backend, allocator_config)?,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            live: Vec::new(),
            report: StressReport::default(),
        })
    }

    /// The allocator under test.
    pub fn allocator(&self) -> &MemoryAllocator {
        &self.allocator
    }

    /// Number of allocations currently held by the harness.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Run one random operation.
    pub fn step(&mut self) -> Result<()> {
        if !self.live.is_empty() && self.rng.gen_bool(self.config.free_ratio) {
            let index = self.rng.gen_range(0..self.live.len());
            let live = self.live.swap_remove(index);
            self.release(&live)
        } else {
            self.allocate()
        }
    }

    fn allocate(&mut self) -> Result<()> {
        let size = self.rng.gen_range(1..=self.config.max_size);
        let alignment = 1u64 << self.rng.gen_range(0..=self.config.max_alignment_shift);
        let usage = USAGES[self.rng.gen_range(0..USAGES.len())];
        let requirements = MemoryRequirements::new(size, alignment);

        let allocation = match self
            .allocator
            .allocate(&requirements, &AllocationCreateInfo::new(usage))
        {
            Ok(allocation) => allocation,
            Err(
                err @ (Error::ArenaReservationFailed { .. } | Error::TooManyAllocations { .. }),
            ) => {
                debug!(%err, size, "allocation refused");
                self.report.failed_allocations += 1;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        if allocation.offset() % alignment != 0 || allocation.size() < size {
            return Err(TestError::Invariant(format!(
                "{} at {}+{} does not satisfy {size} bytes aligned to {alignment}",
                allocation.id(),
                allocation.offset(),
                allocation.size()
            )));
        }

        let mut pattern = None;
        if allocation.is_host_visible() && self.rng.gen_bool(self.config.map_ratio) {
            let ptr = self.allocator.map(&allocation)?;
            let byte: u8 = self.rng.gen();
            let last = usize::try_from(allocation.size() - 1)
                .map_err(|_| TestError::Invariant("allocation exceeds address space".to_string()))?;
            // SAFETY: the allocation is mapped and `size` bytes long.
            unsafe {
                ptr.as_ptr().write(byte);
                ptr.as_ptr().add(last).write(byte);
            }
            pattern = Some(byte);
            self.report.maps += 1;
        }

        self.live.push(LiveAllocation {
            allocation,
            pattern,
        });
        self.report.allocations += 1;
        self.report.peak_live = self.report.peak_live.max(self.live.len());
        self.report.peak_allocated = self
            .report
            .peak_allocated
            .max(self.allocator.stats().total_allocated);
        Ok(())
    }

    fn release(&mut self, live: &LiveAllocation) -> Result<()> {
        let allocation = &live.allocation;
        if let Some(byte) = live.pattern {
            let ptr = self.allocator.mapped_ptr(allocation).ok_or_else(|| {
                TestError::Invariant(format!("{} lost its mapping", allocation.id()))
            })?;
            let last = usize::try_from(allocation.size() - 1)
                .map_err(|_| TestError::Invariant("allocation exceeds address space".to_string()))?;
            // SAFETY: the allocation is still mapped and `size` bytes long.
            let (first, end) = unsafe { (ptr.as_ptr().read(), ptr.as_ptr().add(last).read()) };
            if first != byte || end != byte {
                return Err(TestError::Invariant(format!(
                    "{} contents were overwritten by another allocation",
                    allocation.id()
                )));
            }
        }

        self.allocator.free(allocation)?;
        self.report.frees += 1;
        Ok(())
    }

    /// Check every structural invariant against the current live set.
    pub fn check(&self) -> Result<()> {
        let live: Vec<MemoryAllocation> = self.live.iter().map(|l| l.allocation).collect();
        check_allocations(&self.allocator, &live)
    }

    /// Run the configured number of steps, then free everything and verify
    /// that every pool returned to a single free block.
    pub fn run(mut self) -> Result<StressReport> {
        info!(
            iterations = self.config.iterations,
            seed = self.config.seed,
            "starting stress run"
        );

        for _ in 0..self.config.iterations {
            self.step()?;
            if self.config.check_every_step {
                self.check()?;
            }
        }
        self.check()?;
        self.report.final_stats = Some(self.allocator.stats());

        while let Some(live) = self.live.pop() {
            self.release(&live)?;
        }
        self.check()?;

        let stats = self.allocator.stats();
        if let Some(pool) = stats.pools.iter().find(|p| p.free_block_count != 1) {
            return Err(TestError::Invariant(format!(
                "{} did not coalesce back to one free block",
                pool.id
            )));
        }

        info!(
            allocations = self.report.allocations,
            frees = self.report.frees,
            failed = self.report.failed_allocations,
            peak_allocated = self.report.peak_allocated,
            "stress run complete"
        );
        Ok(self.report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FaultyBackend;
    use vkpool_alloc::HostBackend;
    use vkpool_core::constants::{KIB, MIB};

    fn small_config() -> AllocatorConfig {
        AllocatorConfig::default()
            .with_pool_size(4 * MIB)
            .with_block_size(64 * KIB)
            .with_dedicated_threshold(MIB)
    }

    fn stress(iterations: u32, seed: u64) -> StressConfig {
        StressConfig {
            iterations,
            seed,
            max_size: 2 * MIB,
            ..StressConfig::default()
        }
    }

    #[test]
    fn churn_keeps_invariants() {
        let backend = Arc::new(HostBackend::desktop());
        let harness = StressHarness::new(backend.clone(), small_config(), stress(500, 7)).unwrap();
        let report = harness.run().unwrap();

        assert!(report.allocations > 0);
        assert!(report.frees > 0);
        assert!(report.maps > 0);
        assert_eq!(report.failed_allocations, 0);
        assert!(report.final_stats.is_some());
        assert_eq!(backend.arena_count(), 0);
    }

    #[test]
    fn same_seed_same_report() {
        let run = |seed| {
            StressHarness::new(Arc::new(HostBackend::desktop()), small_config(), stress(200, seed))
                .unwrap()
                .run()
                .unwrap()
        };
        let a = run(42);
        let b = run(42);
        assert_eq!(a.allocations, b.allocations);
        assert_eq!(a.frees, b.frees);
        assert_eq!(a.peak_allocated, b.peak_allocated);
    }

    #[test]
    fn survives_injected_reservation_failures() {
        let host = Arc::new(HostBackend::desktop());
        let faulty = Arc::new(FaultyBackend::new(host.clone(), 3));
        let harness = StressHarness::new(faulty.clone(), small_config(), stress(300, 11)).unwrap();
        let report = harness.run().unwrap();

        assert!(faulty.injected_failures() > 0);
        assert_eq!(report.failed_allocations, faulty.injected_failures());
        assert_eq!(host.arena_count(), 0);
    }

    #[test]
    fn allocation_cap_is_tolerated() {
        let config = small_config().with_max_allocations(8);
        let stress = StressConfig {
            free_ratio: 0.1,
            ..stress(200, 3)
        };
        let harness =
            StressHarness::new(Arc::new(HostBackend::desktop()), config, stress).unwrap();
        let report = harness.run().unwrap();
        assert!(report.peak_live <= 8);
        assert!(report.failed_allocations > 0);
    }

    #[test]
    fn rejects_bad_ratios() {
        let config = StressConfig {
            free_ratio: 1.5,
            ..StressConfig::default()
        };
        let backend = Arc::new(HostBackend::desktop());
        assert!(StressHarness::new(backend, small_config(), config).is_err());
    }
}
