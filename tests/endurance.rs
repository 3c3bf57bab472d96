//! Scaled-down endurance run: sustained churn at high occupancy
//!
//! Mirrors the workload driver's endurance mode at test-friendly scale:
//! repeatedly fill the segment to 95% with random 512 B - 1 MiB requests,
//! then drop a random 30-50% of live extents, verifying the two bitmap
//! levels and the byte counter after every cycle.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use segspace::{BitmapAllocator, SpaceAllocator};

const CAPACITY: u64 = 256 << 20;
const TARGET_WRITE: u64 = 2 << 30;
const TARGET_UTILIZATION: f64 = 0.95;

fn request_size(rng: &mut StdRng) -> u64 {
    let size = rng.gen_range(512u64..=1 << 20);
    (size + 511) & !511
}

#[test]
fn sustained_churn_at_high_utilization() {
    let alloc = BitmapAllocator::new(CAPACITY, 4096);
    let mut rng = StdRng::seed_from_u64(7);

    let mut live: Vec<(u64, u64)> = Vec::new();
    let mut total_written = 0u64;
    let mut cycles = 0u64;

    while total_written < TARGET_WRITE {
        cycles += 1;

        // Fill phase: push occupancy to the target. A large request can
        // lose to fragmentation while smaller ones still fit, so only a
        // streak of refusals ends the phase.
        let mut refusals = 0;
        while alloc.utilization() < TARGET_UTILIZATION && refusals < 8 {
            match alloc.allocate(request_size(&mut rng)) {
                Ok(ext) => {
                    refusals = 0;
                    live.push((ext.offset, ext.length));
                    total_written += ext.length;
                }
                Err(_) => refusals += 1,
            }
        }
        assert!(
            alloc.utilization() > 0.9,
            "cycle {} stalled at {:.1}% utilization",
            cycles,
            alloc.utilization() * 100.0
        );

        // Delete phase: drop 30-50% of live extents at random.
        let delete_count = (live.len() as f64 * (0.3 + rng.gen::<f64>() * 0.2)) as usize;
        for _ in 0..delete_count {
            let idx = rng.gen_range(0..live.len());
            let (offset, length) = live.swap_remove(idx);
            alloc.free(offset, length);
        }

        alloc.check_consistency().unwrap_or_else(|err| {
            panic!("cycle {}: {}", cycles, err);
        });

        let live_bytes: u64 = live.iter().map(|&(_, length)| length).sum();
        assert_eq!(alloc.allocated_bytes(), live_bytes);
    }

    assert!(cycles > 3, "workload too small to exercise churn");
}
