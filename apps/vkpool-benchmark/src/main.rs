//! vkpool allocator churn benchmark
//!
//! Runs a seeded allocate/free/map workload against the allocator and
//! reports throughput and final statistics.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release -p vkpool-benchmark -- [OPTIONS]
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod params;

use std::sync::Arc;
use std::time::Instant;

use tracing::info;
use tracing_subscriber::EnvFilter;
use vkpool_alloc::{HostBackend, MemoryBackend};
use vkpool_test::StressHarness;
use vkpool_vulkan::HeadlessDeviceBuilder;

use crate::params::BenchParams;

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let params = BenchParams::from_args();
    info!(?params, "vkpool benchmark");

    // Keep the device alive until the harness is done with its backend.
    let device = if params.vulkan {
        Some(HeadlessDeviceBuilder::new().validation(false).build()?)
    } else {
        None
    };
    let backend: Arc<dyn MemoryBackend> = match &device {
        Some(device) => device.backend(),
        None => Arc::new(HostBackend::desktop()),
    };

    let harness = StressHarness::new(backend, params.allocator_config(), params.stress_config())?;
    let start = Instant::now();
    let report = harness.run()?;
    let elapsed = start.elapsed();

    let ops = report.allocations + report.frees;
    info!(
        ops,
        elapsed_ms = elapsed.as_millis() as u64,
        ops_per_sec = ops as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        failed = report.failed_allocations,
        peak_live = report.peak_live,
        peak_allocated = report.peak_allocated,
        "workload complete"
    );
    if let Some(stats) = &report.final_stats {
        info!("{}", stats.summary());
        for pool in &stats.pools {
            info!(
                pool = %pool.id,
                type_index = pool.type_index,
                used = pool.used_size,
                free = pool.free_size,
                blocks = pool.block_count,
                fragmentation = pool.fragmentation(),
                "pool"
            );
        }
    }

    drop(device);
    Ok(())
}

fn print_help() {
    eprintln!(
        "vkpool allocator churn benchmark

USAGE:
    cargo run --release -p vkpool-benchmark -- [OPTIONS]

WORKLOAD OPTIONS:
    -n, --iterations <N>    Number of operations (default: 100000)
    --seed <N>              RNG seed (default: 42)
    --max-size-kib <N>      Largest request in KiB (default: 512)
    --check                 Verify allocator invariants after every step

ALLOCATOR OPTIONS:
    --pool-size-mib <N>     Pool size in MiB (default: 64)
    --dedicated-mib <N>     Dedicated allocation threshold in MiB (default: 16)
    --max-allocations <N>   Live allocation cap (default: 4096)

BACKEND OPTIONS:
    --vulkan                Allocate real device memory on a headless Vulkan device

OTHER:
    -h, --help              Print this help message"
    );
}
