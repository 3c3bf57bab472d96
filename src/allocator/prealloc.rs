//! Slab cache of pre-reserved extents
//!
//! Sits in front of a [`SpaceAllocator`] and hands out space from a pool of
//! extents that were reserved ahead of time, so bursty writers skip the
//! bitmap scan entirely. The cache never changes the backing allocator's
//! observable semantics: every cached byte stays accounted as allocated
//! until it is drained back.

use crate::allocator::{Extent, SpaceAllocator};
use crate::error::Result;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Tuning knobs for the pre-allocation cache
#[derive(Debug, Clone)]
pub struct PreallocConfig {
    /// Total bytes the cache tries to keep reserved
    pub target_cached: u64,
    /// Growth multiplier applied by each maintenance tick
    pub growth_factor: f64,
    /// Hard ceiling on cached bytes; surplus is drained on maintenance
    pub max_cached: u64,
    /// Reservation granularity; cache refills in chunks of this size
    pub chunk_size: u64,
    /// Stop growing the cache once backing utilization passes this point
    pub high_watermark: f64,
}

impl Default for PreallocConfig {
    fn default() -> Self {
        PreallocConfig {
            target_cached: 64 << 20,
            growth_factor: 1.5,
            max_cached: 256 << 20,
            chunk_size: 4 << 20,
            high_watermark: 0.8,
        }
    }
}

/// Extent cache in front of a space allocator
pub struct Preallocator<A: SpaceAllocator> {
    config: PreallocConfig,
    backing: A,
    cached: Mutex<Vec<Extent>>,
}

impl<A: SpaceAllocator> Preallocator<A> {
    /// Wrap `backing` and reserve the initial pool
    ///
    /// The initial reservation is best-effort: a backing allocator that is
    /// already tight simply yields a smaller pool.
    pub fn new(backing: A, config: PreallocConfig) -> Self {
        let prealloc = Preallocator {
            config,
            backing,
            cached: Mutex::new(Vec::new()),
        };
        prealloc.refill(prealloc.config.target_cached);
        prealloc
    }

    /// Hand out an extent of at least `size` bytes
    ///
    /// First fit over the cached pool; falls through to the backing
    /// allocator when nothing cached is large enough. The extent returned
    /// from the pool is handed out whole, so callers must free
    /// `(offset, length)` exactly as returned.
    pub fn acquire(&self, size: u64) -> Result<Extent> {
        {
            let mut cached = self.cached.lock();
            if let Some(idx) = cached.iter().position(|ext| ext.length >= size) {
                return Ok(cached.swap_remove(idx));
            }
        }
        self.backing.allocate(size)
    }

    /// Return an extent to the pool for reuse
    pub fn release(&self, extent: Extent) {
        self.cached.lock().push(extent);
    }

    /// Maintenance tick: grow toward the target, drain past the ceiling
    ///
    /// The original layer ran this on a timer; here the owner calls it at
    /// whatever cadence suits the workload.
    pub fn maintain(&self) {
        let cached_total = self.cached_bytes();

        if cached_total > self.config.max_cached {
            self.drain(cached_total - self.config.max_cached);
            return;
        }

        if self.backing.utilization() >= self.config.high_watermark {
            return;
        }

        let goal = ((cached_total as f64) * self.config.growth_factor) as u64;
        let goal = goal.clamp(self.config.target_cached, self.config.max_cached);
        if goal > cached_total {
            self.refill(goal - cached_total);
        }
    }

    /// Bytes currently held in the pool
    pub fn cached_bytes(&self) -> u64 {
        self.cached.lock().iter().map(|ext| ext.length).sum()
    }

    /// Access the backing allocator
    pub fn backing(&self) -> &A {
        &self.backing
    }

    /// Drain the entire pool back to the backing allocator
    pub fn close(&self) {
        let drained: Vec<Extent> = std::mem::take(&mut *self.cached.lock());
        for ext in drained {
            self.backing.free(ext.offset, ext.length);
        }
    }

    fn refill(&self, mut wanted: u64) {
        let mut chunk = self.config.chunk_size.max(1);
        while wanted > 0 {
            match self.backing.allocate(wanted.min(chunk).max(1)) {
                Ok(ext) => {
                    wanted = wanted.saturating_sub(ext.length);
                    self.cached.lock().push(ext);
                }
                Err(err) => {
                    // Tight or fragmented backing: retry with smaller
                    // chunks before giving up on the rest of the target.
                    chunk /= 2;
                    if chunk == 0 {
                        debug!(%err, "pre-allocation refill stopped short");
                        return;
                    }
                }
            }
        }
    }

    fn drain(&self, mut surplus: u64) {
        let mut cached = self.cached.lock();
        while surplus > 0 {
            let Some(ext) = cached.pop() else {
                warn!("cached byte total out of sync with the pool");
                return;
            };
            self.backing.free(ext.offset, ext.length);
            surplus = surplus.saturating_sub(ext.length);
        }
    }
}

impl<A: SpaceAllocator> Drop for Preallocator<A> {
    fn drop(&mut self) {
        self.close();
    }
}
