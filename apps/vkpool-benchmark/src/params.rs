//! Command-line parameters.

use vkpool_alloc::AllocatorConfig;
use vkpool_core::constants::{KIB, MIB};
use vkpool_test::StressConfig;

/// Benchmark parameters.
#[derive(Debug, Clone)]
pub struct BenchParams {
    pub iterations: u32,
    pub seed: u64,
    /// Largest request in bytes.
    pub max_size: u64,
    pub pool_size: u64,
    pub dedicated_threshold: u64,
    pub max_allocations: u32,
    /// Use a real Vulkan device instead of host memory.
    pub vulkan: bool,
    /// Run invariant checks after every step.
    pub check: bool,
}

impl Default for BenchParams {
    fn default() -> Self {
        let allocator = AllocatorConfig::default();
        Self {
            iterations: 100_000,
            seed: 42,
            max_size: 512 * KIB,
            pool_size: 64 * MIB,
            dedicated_threshold: 16 * MIB,
            max_allocations: allocator.max_allocations,
            vulkan: false,
            check: false,
        }
    }
}

impl BenchParams {
    /// Parse parameters from the process arguments.
    pub fn from_args() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    /// Parse parameters from an argument list without the program name.
    ///
    /// Unknown flags and unparsable values are ignored.
    pub fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut params = Self::default();
        let args: Vec<String> = args.into_iter().collect();

        let mut i = 0;
        while i < args.len() {
            let value = args.get(i + 1);
            let consumed = match args[i].as_str() {
                "-n" | "--iterations" => parse_into(value, &mut params.iterations),
                "--seed" => parse_into(value, &mut params.seed),
                "--max-size-kib" => parse_kib(value, &mut params.max_size),
                "--pool-size-mib" => parse_mib(value, &mut params.pool_size),
                "--dedicated-mib" => parse_mib(value, &mut params.dedicated_threshold),
                "--max-allocations" => parse_into(value, &mut params.max_allocations),
                "--vulkan" => {
                    params.vulkan = true;
                    false
                }
                "--check" => {
                    params.check = true;
                    false
                }
                _ => false,
            };
            i += if consumed { 2 } else { 1 };
        }

        params
    }

    /// Allocator configuration for this run.
    pub fn allocator_config(&self) -> AllocatorConfig {
        AllocatorConfig::default()
            .with_pool_size(self.pool_size)
            .with_dedicated_threshold(self.dedicated_threshold)
            .with_max_allocations(self.max_allocations)
    }

    /// Workload configuration for this run.
    pub fn stress_config(&self) -> StressConfig {
        StressConfig {
            iterations: self.iterations,
            seed: self.seed,
            max_size: self.max_size,
            check_every_step: self.check,
            ..StressConfig::default()
        }
    }
}

fn parse_into<T: std::str::FromStr>(value: Option<&String>, slot: &mut T) -> bool {
    match value.and_then(|v| v.parse().ok()) {
        Some(v) => {
            *slot = v;
            true
        }
        None => false,
    }
}

fn parse_kib(value: Option<&String>, slot: &mut u64) -> bool {
    let mut kib = 0u64;
    let consumed = parse_into(value, &mut kib);
    if consumed {
        *slot = kib.saturating_mul(KIB);
    }
    consumed
}

fn parse_mib(value: Option<&String>, slot: &mut u64) -> bool {
    let mut mib = 0u64;
    let consumed = parse_into(value, &mut mib);
    if consumed {
        *slot = mib.saturating_mul(MIB);
    }
    consumed
}
