//! Space allocation for the segment's flat byte range
//!
//! The allocator answers one question per request: where in the segment can
//! this many bytes be placed? Placement is page-granular and tracked by a
//! two-level bitmap:
//! - Level 0: one bit per page (1 = free)
//! - Level 1: one bit per unit-set of 8 level-0 words, used to skip 512
//!   pages at a time during the search

pub mod bitmap;
pub mod bits;
pub mod prealloc;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A contiguous byte range handed out by an allocator
///
/// Both fields are multiples of the allocator's page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// Starting byte offset within the managed range
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
}

impl Extent {
    pub fn new(offset: u64, length: u64) -> Self {
        Extent { offset, length }
    }

    /// One past the last byte of this extent
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Check if this extent contains a byte offset
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

/// Space allocator over a flat byte range
///
/// Defines the seam between space consumers (the segment layer, the
/// pre-allocator cache) and the placement strategy.
pub trait SpaceAllocator {
    /// Reserve at least `size` bytes of contiguous space
    ///
    /// The returned extent is page-aligned and may be larger than `size`
    /// due to rounding. Exhaustion and fragmentation are reported as
    /// errors, never as panics.
    fn allocate(&self, size: u64) -> Result<Extent>;

    /// Return a previously allocated byte range
    ///
    /// Misaligned input is normalised to page boundaries and clamped to
    /// capacity. Freeing already-free pages does not corrupt the map.
    fn free(&self, offset: u64, size: u64);

    /// Fraction of capacity currently allocated, in `[0, 1]`
    fn utilization(&self) -> f64;

    /// Bytes currently allocated
    fn allocated_bytes(&self) -> u64;

    /// Managed capacity in bytes (page-aligned)
    fn capacity_bytes(&self) -> u64;

    /// Bytes of metadata the allocator itself consumes
    fn metadata_bytes(&self) -> u64;
}

impl<A: SpaceAllocator + ?Sized> SpaceAllocator for Arc<A> {
    fn allocate(&self, size: u64) -> Result<Extent> {
        (**self).allocate(size)
    }

    fn free(&self, offset: u64, size: u64) {
        (**self).free(offset, size)
    }

    fn utilization(&self) -> f64 {
        (**self).utilization()
    }

    fn allocated_bytes(&self) -> u64 {
        (**self).allocated_bytes()
    }

    fn capacity_bytes(&self) -> u64 {
        (**self).capacity_bytes()
    }

    fn metadata_bytes(&self) -> u64 {
        (**self).metadata_bytes()
    }
}
