//! Segspace workload driver
//!
//! Exercises the bitmap allocator with the mixed write/delete workloads
//! the segment layer produces in practice: many small allocations with
//! occasional multi-megabyte ones, sustained near-full occupancy, and
//! heavy delete churn between write bursts.

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use segspace::{BitmapAllocator, SpaceAllocator};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{info, warn};

const TIB: u64 = 1 << 40;

#[derive(Parser, Debug)]
#[command(name = "segspace-workload")]
#[command(about = "Allocation workload driver for segspace")]
struct Args {
    /// Workload mode: normal or endurance
    #[arg(short, long, default_value = "normal")]
    mode: String,

    /// Managed capacity in bytes
    #[arg(short, long, default_value_t = TIB)]
    capacity: u64,

    /// Page size in bytes (power of two)
    #[arg(short, long, default_value_t = 4096)]
    page_size: u32,

    /// Ratio of delete operations in normal mode (0.0-1.0)
    #[arg(long, default_value_t = 0.3)]
    delete_ratio: f64,

    /// Minimum request size in bytes
    #[arg(long, default_value_t = 512)]
    min_size: u64,

    /// Maximum request size in bytes
    #[arg(long, default_value_t = 4 << 20)]
    max_size: u64,

    /// Number of operations in normal mode
    #[arg(short, long, default_value_t = 1000)]
    operations: u64,

    /// Total bytes to write across endurance cycles
    #[arg(long, default_value_t = 10 * TIB)]
    target_write: u64,

    /// Utilization at which an endurance cycle stops filling
    #[arg(long, default_value_t = 0.95)]
    target_utilization: f64,

    /// Skip the allocator consistency check after each cycle
    #[arg(long)]
    no_check: bool,

    /// Seed for the request generator
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

struct WorkloadStats {
    alloc_success: u64,
    alloc_failed: u64,
    delete_success: u64,
    total_written: u64,
}

impl WorkloadStats {
    fn new() -> Self {
        WorkloadStats {
            alloc_success: 0,
            alloc_failed: 0,
            delete_success: 0,
            total_written: 0,
        }
    }
}

/// Random request size in `[min, max]`, rounded up to 512 bytes
fn generate_request(rng: &mut StdRng, min: u64, max: u64) -> u64 {
    let size = rng.gen_range(min..=max);
    (size + 511) & !511
}

fn run_normal(args: &Args, alloc: &BitmapAllocator, rng: &mut StdRng) -> WorkloadStats {
    let mut stats = WorkloadStats::new();
    let mut live: HashMap<u64, u64> = HashMap::new();
    let mut offsets: Vec<u64> = Vec::new();

    for _ in 0..args.operations {
        if rng.gen_bool(args.delete_ratio) && !offsets.is_empty() {
            let idx = rng.gen_range(0..offsets.len());
            let offset = offsets.swap_remove(idx);
            let size = live.remove(&offset).expect("tracked offset");
            alloc.free(offset, size);
            stats.delete_success += 1;
        } else {
            let size = generate_request(rng, args.min_size, args.max_size);
            match alloc.allocate(size) {
                Ok(ext) => {
                    live.insert(ext.offset, ext.length);
                    offsets.push(ext.offset);
                    stats.alloc_success += 1;
                    stats.total_written += size;
                }
                Err(err) => {
                    warn!(%err, size, "allocation failed");
                    stats.alloc_failed += 1;
                }
            }
        }
    }

    stats
}

fn run_endurance(args: &Args, alloc: &BitmapAllocator, rng: &mut StdRng) -> WorkloadStats {
    let mut stats = WorkloadStats::new();
    let mut live: HashMap<u64, u64> = HashMap::new();
    let mut offsets: Vec<u64> = Vec::new();
    let mut cycle = 0u64;

    while stats.total_written < args.target_write {
        cycle += 1;
        let cycle_start = Instant::now();

        // Phase 1: fill until the target utilization or the first refusal.
        loop {
            if alloc.utilization() >= args.target_utilization {
                break;
            }
            let size = generate_request(rng, args.min_size, args.max_size);
            match alloc.allocate(size) {
                Ok(ext) => {
                    live.insert(ext.offset, ext.length);
                    offsets.push(ext.offset);
                    stats.alloc_success += 1;
                    stats.total_written += size;
                }
                Err(_) => {
                    stats.alloc_failed += 1;
                    break;
                }
            }
        }

        if offsets.is_empty() {
            warn!("no live extents to delete, stopping");
            break;
        }

        // Phase 2: random deletion of 30-50% of live extents.
        let delete_ratio = 0.3 + rng.gen::<f64>() * 0.2;
        let delete_count = ((offsets.len() as f64) * delete_ratio) as usize;
        for _ in 0..delete_count {
            let idx = rng.gen_range(0..offsets.len());
            let offset = offsets.swap_remove(idx);
            let size = live.remove(&offset).expect("tracked offset");
            alloc.free(offset, size);
            stats.delete_success += 1;
        }

        if !args.no_check {
            alloc
                .check_consistency()
                .expect("allocator invariants must hold after each cycle");
        }

        info!(
            cycle,
            written_tib = stats.total_written as f64 / TIB as f64,
            utilization = alloc.utilization(),
            live = offsets.len(),
            elapsed_ms = cycle_start.elapsed().as_millis() as u64,
            "cycle complete"
        );
    }

    stats
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    if !(0.0..=1.0).contains(&args.delete_ratio) {
        eprintln!("delete ratio must be between 0 and 1");
        std::process::exit(1);
    }
    if args.min_size == 0 || args.min_size > args.max_size {
        eprintln!("request sizes must satisfy 0 < min-size <= max-size");
        std::process::exit(1);
    }

    info!(mode = %args.mode, capacity = args.capacity, "starting workload");
    let alloc = BitmapAllocator::new(args.capacity, args.page_size);
    let mut rng = StdRng::seed_from_u64(args.seed);

    let start = Instant::now();
    let stats = match args.mode.as_str() {
        "endurance" => run_endurance(&args, &alloc, &mut rng),
        "normal" => run_normal(&args, &alloc, &mut rng),
        other => {
            eprintln!("unknown mode '{}', expected normal or endurance", other);
            std::process::exit(1);
        }
    };
    let elapsed = start.elapsed();

    if !args.no_check {
        alloc.check_consistency().expect("final consistency check");
    }

    info!("workload results:");
    info!("  duration: {:?}", elapsed);
    info!("  successful allocations: {}", stats.alloc_success);
    info!("  failed allocations: {}", stats.alloc_failed);
    info!("  successful deletions: {}", stats.delete_success);
    info!(
        "  total data written: {:.2} TiB",
        stats.total_written as f64 / TIB as f64
    );
    info!(
        "  used space: {:.2} GiB",
        alloc.allocated_bytes() as f64 / (1 << 30) as f64
    );
    info!("  disk utilization: {:.2}%", alloc.utilization() * 100.0);
    info!(
        "  metadata footprint: {:.2} MiB",
        alloc.metadata_bytes() as f64 / (1 << 20) as f64
    );
}
