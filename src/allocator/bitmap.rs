//! Two-level hierarchical bitmap allocator
//!
//! Tracks free space over a flat byte range with one level-0 bit per page,
//! 1 = free. Level 1 summarises unit-sets of 8 level-0 words (512 pages):
//! a set bit means the unit-set still has at least one free page. At 4 KiB
//! pages a cleared summary bit writes off 2 MiB of fully allocated space
//! with one test, and a cleared summary word 128 MiB.
//!
//! The "1 = free" polarity makes "find free" a find-set-bit operation and
//! lets a fully allocated region read as zero at both levels.

use crate::allocator::{bits, Extent, SpaceAllocator};
use crate::error::{Result, SegspaceError};
use parking_lot::RwLock;

/// Bits per bitmap word
const UNIT_BITS: u64 = 64;

/// Level-0 words per unit-set
const UNITS_PER_UNIT_SET: u64 = 8;

/// Pages covered by one unit-set (one level-1 bit)
const UNIT_SET_PAGES: u64 = UNIT_BITS * UNITS_PER_UNIT_SET;

const ALL_SET: u64 = u64::MAX;
const ALL_CLEAR: u64 = 0;

/// Page-granular space allocator for a single segment
///
/// The two bitmap buffers are allocated once at construction; allocate and
/// free never touch the heap. A rolling cursor remembers where the last
/// allocation ended so consecutive requests tend to walk forward instead
/// of rescanning the low pages.
pub struct BitmapAllocator {
    state: RwLock<BitmapState>,
}

struct BitmapState {
    /// Allocation quantum in bytes (power of two)
    page_size: u64,

    /// Managed capacity in bytes, page-aligned
    capacity: u64,

    /// Number of pages covered by real capacity
    total_pages: u64,

    /// Per-page free bits; bits at or beyond `total_pages` stay clear
    level0: Vec<u64>,

    /// Per-unit-set summary bits
    level1: Vec<u64>,

    /// Bytes currently allocated, always a page multiple
    allocated: u64,

    /// Byte offset hint for the next search, <= capacity
    cursor: u64,
}

impl BitmapAllocator {
    /// Create an allocator over `capacity_bytes` of space
    ///
    /// `capacity_bytes` is rounded down to a page multiple; all pages start
    /// out free.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is zero or not a power of two.
    pub fn new(capacity_bytes: u64, page_size: u32) -> Self {
        assert!(
            page_size != 0 && page_size.is_power_of_two(),
            "page size must be a power of two, got {}",
            page_size
        );

        let page_size = page_size as u64;
        let capacity = bits::align_down(capacity_bytes, page_size);
        let total_pages = capacity / page_size;

        let l0_words = total_pages.div_ceil(UNIT_BITS) as usize;
        let unit_sets = total_pages.div_ceil(UNIT_SET_PAGES);
        let l1_words = unit_sets.div_ceil(UNIT_BITS) as usize;

        let mut state = BitmapState {
            page_size,
            capacity,
            total_pages,
            level0: vec![ALL_CLEAR; l0_words],
            level1: vec![ALL_CLEAR; l1_words],
            allocated: 0,
            cursor: 0,
        };

        if total_pages > 0 {
            state.l0_mark(0, total_pages, true);
            state.l1_refresh(0, unit_sets);
        }

        BitmapAllocator {
            state: RwLock::new(state),
        }
    }

    /// Configured page size in bytes
    pub fn page_size(&self) -> u32 {
        self.state.read().page_size as u32
    }

    /// Number of pages the allocator manages
    pub fn total_pages(&self) -> u64 {
        self.state.read().total_pages
    }

    /// Walk level 0 and cross-check the summary and counters
    ///
    /// Recomputes every level-1 bit from the level-0 words it covers and
    /// recomputes the allocated byte count from the level-0 population.
    /// Any mismatch means the map was corrupted.
    pub fn check_consistency(&self) -> Result<()> {
        self.state.read().check_consistency()
    }
}

impl SpaceAllocator for BitmapAllocator {
    fn allocate(&self, size: u64) -> Result<Extent> {
        self.state.write().allocate(size)
    }

    fn free(&self, offset: u64, size: u64) {
        self.state.write().free(offset, size)
    }

    fn utilization(&self) -> f64 {
        let state = self.state.read();
        if state.capacity == 0 {
            0.0
        } else {
            state.allocated as f64 / state.capacity as f64
        }
    }

    fn allocated_bytes(&self) -> u64 {
        self.state.read().allocated
    }

    fn capacity_bytes(&self) -> u64 {
        self.state.read().capacity
    }

    fn metadata_bytes(&self) -> u64 {
        let state = self.state.read();
        8 * (state.level0.len() + state.level1.len()) as u64
    }
}

impl BitmapState {
    fn unit_sets(&self) -> u64 {
        self.total_pages.div_ceil(UNIT_SET_PAGES)
    }

    fn l1_has_free(&self, unit_set: u64) -> bool {
        let word = self.level1[(unit_set / UNIT_BITS) as usize];
        (word >> (unit_set % UNIT_BITS)) & 1 == 1
    }

    /// Set (`free = true`) or clear every level-0 bit in `[start, end)`
    ///
    /// Partial head and tail words are masked; full middle words are
    /// written with a single constant store each.
    fn l0_mark(&mut self, start: u64, end: u64, free: bool) {
        debug_assert!(end <= self.total_pages);
        if start >= end {
            return;
        }

        let first = (start / UNIT_BITS) as usize;
        let last = ((end - 1) / UNIT_BITS) as usize;
        let head_bit = (start % UNIT_BITS) as u32;
        let tail_bit = (end - last as u64 * UNIT_BITS) as u32;

        if first == last {
            let mask = bits::span_mask(head_bit, tail_bit);
            if free {
                self.level0[first] |= mask;
            } else {
                self.level0[first] &= !mask;
            }
            return;
        }

        let head_mask = bits::span_mask(head_bit, 64);
        let tail_mask = bits::span_mask(0, tail_bit);
        if free {
            self.level0[first] |= head_mask;
            self.level0[first + 1..last].fill(ALL_SET);
            self.level0[last] |= tail_mask;
        } else {
            self.level0[first] &= !head_mask;
            self.level0[first + 1..last].fill(ALL_CLEAR);
            self.level0[last] &= !tail_mask;
        }
    }

    /// Recompute the level-1 bit for every unit-set in `[us_start, us_end)`
    ///
    /// The summary is exact, not a hint: a bit is set iff any of the 8
    /// covered level-0 words is non-zero.
    fn l1_refresh(&mut self, us_start: u64, us_end: u64) {
        let us_end = us_end.min(self.unit_sets());
        for unit_set in us_start..us_end {
            let lo = (unit_set * UNITS_PER_UNIT_SET) as usize;
            let hi = (lo + UNITS_PER_UNIT_SET as usize).min(self.level0.len());
            let has_free = self.level0[lo..hi].iter().any(|&w| w != ALL_CLEAR);

            let word = &mut self.level1[(unit_set / UNIT_BITS) as usize];
            let bit = 1u64 << (unit_set % UNIT_BITS);
            if has_free {
                *word |= bit;
            } else {
                *word &= !bit;
            }
        }
    }

    /// Refresh every unit-set touched by the page range `[start, end)`
    fn l1_refresh_span(&mut self, start: u64, end: u64) {
        let us_start = start / UNIT_SET_PAGES;
        let us_end = end.div_ceil(UNIT_SET_PAGES);
        self.l1_refresh(us_start, us_end);
    }

    /// First-fit scan for `need` consecutive free pages starting at `from`
    ///
    /// Runs may cross word and unit-set boundaries but never capacity: the
    /// tail bits past `total_pages` are permanently clear and break any
    /// run. While no run is in progress, fully allocated unit-sets are
    /// skipped via the summary without reading their level-0 words.
    fn find_run(&self, from: u64, need: u64) -> Option<u64> {
        let mut run_start = 0u64;
        let mut run_len = 0u64;
        let mut page = from;

        while page < self.total_pages {
            if run_len == 0 {
                let unit_set = page / UNIT_SET_PAGES;
                let l1_word = self.level1[(unit_set / UNIT_BITS) as usize];
                if l1_word == ALL_CLEAR {
                    // 64 fully allocated unit-sets in one compare.
                    page = (unit_set / UNIT_BITS + 1) * UNIT_BITS * UNIT_SET_PAGES;
                    continue;
                }
                if (l1_word >> (unit_set % UNIT_BITS)) & 1 == 0 {
                    page = (unit_set + 1) * UNIT_SET_PAGES;
                    continue;
                }
            }

            let word_idx = (page / UNIT_BITS) as usize;
            let word = self.level0[word_idx];
            let bit = (page % UNIT_BITS) as u32;

            if (word >> bit) & 1 == 0 {
                // Run breaks here; hop to the next free page in this word.
                run_len = 0;
                let next = bits::first_set_from(word, bit);
                page = if next == 64 {
                    (word_idx as u64 + 1) * UNIT_BITS
                } else {
                    word_idx as u64 * UNIT_BITS + next as u64
                };
                continue;
            }

            // Count consecutive free pages from `bit` to the word edge.
            let free = (!(word >> bit)).trailing_zeros() as u64;
            if run_len == 0 {
                run_start = page;
            }
            run_len += free;
            page += free;

            if run_len >= need {
                return Some(run_start);
            }
        }

        None
    }

    fn allocate(&mut self, requested: u64) -> Result<Extent> {
        if requested == 0 {
            return Err(SegspaceError::ZeroRequest);
        }

        let available = self.capacity - self.allocated;
        if requested > available {
            return Err(SegspaceError::InsufficientSpace {
                requested,
                available,
            });
        }
        let length = bits::align_up(requested, self.page_size);
        if length > available {
            return Err(SegspaceError::InsufficientSpace {
                requested: length,
                available,
            });
        }
        let need = length / self.page_size;

        // The cursor is a hint only: a miss past it may still succeed from
        // page 0 after a free landed behind the cursor, so wrap once.
        let hint = (self.cursor / self.page_size).min(self.total_pages);
        let start = match self.find_run(hint, need) {
            Some(start) => start,
            None => match self.find_run(0, need) {
                Some(start) => start,
                None => return Err(SegspaceError::NoContiguousRun { pages: need }),
            },
        };
        let end = start + need;

        self.l0_mark(start, end, false);
        self.l1_refresh_span(start, end);
        self.cursor = end * self.page_size;
        self.allocated += length;

        Ok(Extent::new(start * self.page_size, length))
    }

    fn free(&mut self, offset: u64, size: u64) {
        if size == 0 {
            return;
        }

        // Normalise to page boundaries and clamp to capacity; freeing an
        // already-free page is an idempotent set.
        let start = (offset / self.page_size).min(self.total_pages);
        let end_byte = bits::align_up(offset.saturating_add(size).min(self.capacity), self.page_size);
        let end = (end_byte / self.page_size).min(self.total_pages);
        if start >= end {
            return;
        }

        self.l0_mark(start, end, true);
        self.l1_refresh_span(start, end);

        let bytes = (end - start) * self.page_size;
        self.allocated -= bytes.min(self.allocated);
    }

    fn check_consistency(&self) -> Result<()> {
        // Tail bits past capacity must never read as free.
        if self.total_pages % UNIT_BITS != 0 {
            let last = (self.total_pages / UNIT_BITS) as usize;
            let tail = bits::span_mask((self.total_pages % UNIT_BITS) as u32, 64);
            if self.level0[last] & tail != 0 {
                return Err(SegspaceError::Corrupt(format!(
                    "free bits past page {} in level-0 word {}",
                    self.total_pages, last
                )));
            }
        }

        // Every level-1 bit must match the level-0 words it summarises.
        let unit_sets = self.unit_sets();
        for unit_set in 0..unit_sets {
            let lo = (unit_set * UNITS_PER_UNIT_SET) as usize;
            let hi = (lo + UNITS_PER_UNIT_SET as usize).min(self.level0.len());
            let has_free = self.level0[lo..hi].iter().any(|&w| w != ALL_CLEAR);
            if has_free != self.l1_has_free(unit_set) {
                return Err(SegspaceError::Corrupt(format!(
                    "level-1 bit {} is {}, level-0 words say {}",
                    unit_set,
                    self.l1_has_free(unit_set),
                    has_free
                )));
            }
        }
        for stray in unit_sets..self.level1.len() as u64 * UNIT_BITS {
            if self.l1_has_free(stray) {
                return Err(SegspaceError::Corrupt(format!(
                    "level-1 bit {} set past the last unit-set",
                    stray
                )));
            }
        }

        // The running byte counter must match the level-0 population.
        let free_pages: u64 = self.level0.iter().map(|w| w.count_ones() as u64).sum();
        let counted = (self.total_pages - free_pages) * self.page_size;
        if counted != self.allocated {
            return Err(SegspaceError::Corrupt(format!(
                "allocated counter is {} bytes, level 0 accounts for {}",
                self.allocated, counted
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 4096;

    fn fresh(pages: u64) -> BitmapAllocator {
        BitmapAllocator::new(pages * PAGE, PAGE as u32)
    }

    #[test]
    fn test_new_starts_empty() {
        let alloc = fresh(1024);
        assert_eq!(alloc.total_pages(), 1024);
        assert_eq!(alloc.allocated_bytes(), 0);
        assert_eq!(alloc.utilization(), 0.0);
        alloc.check_consistency().unwrap();
    }

    #[test]
    fn test_capacity_rounds_down() {
        let alloc = BitmapAllocator::new(3 * PAGE + 17, PAGE as u32);
        assert_eq!(alloc.capacity_bytes(), 3 * PAGE);
        assert_eq!(alloc.total_pages(), 3);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_non_power_of_two_page_size_panics() {
        BitmapAllocator::new(1 << 20, 4095);
    }

    #[test]
    fn test_first_allocation_at_offset_zero() {
        let alloc = fresh(1024);
        let ext = alloc.allocate(1).unwrap();
        assert_eq!(ext.offset, 0);
        assert_eq!(ext.length, PAGE);
        assert_eq!(alloc.allocated_bytes(), PAGE);
        alloc.check_consistency().unwrap();
    }

    #[test]
    fn test_requests_round_up_to_pages() {
        let alloc = fresh(1024);
        assert_eq!(alloc.allocate(PAGE + 1).unwrap().length, 2 * PAGE);
        assert_eq!(alloc.allocate(PAGE).unwrap().length, PAGE);

        let small = BitmapAllocator::new(1 << 20, 512);
        assert_eq!(small.allocate(513).unwrap().length, 1024);
    }

    #[test]
    fn test_sequential_allocations_do_not_overlap() {
        let alloc = fresh(1024);
        let a = alloc.allocate(16 * PAGE).unwrap();
        let b = alloc.allocate(16 * PAGE).unwrap();
        assert_eq!(a.end(), b.offset);
        alloc.check_consistency().unwrap();
    }

    #[test]
    fn test_zero_request_rejected() {
        let alloc = fresh(16);
        assert!(matches!(
            alloc.allocate(0),
            Err(SegspaceError::ZeroRequest)
        ));
    }

    #[test]
    fn test_exact_capacity_fill() {
        let alloc = fresh(64);
        let ext = alloc.allocate(64 * PAGE).unwrap();
        assert_eq!(ext.offset, 0);
        assert_eq!(alloc.utilization(), 1.0);

        assert!(matches!(
            alloc.allocate(PAGE),
            Err(SegspaceError::InsufficientSpace { .. })
        ));

        alloc.free(ext.offset, ext.length);
        assert_eq!(alloc.allocated_bytes(), 0);
        alloc.check_consistency().unwrap();
    }

    #[test]
    fn test_free_makes_space_reusable() {
        let alloc = fresh(8);
        let a = alloc.allocate(4 * PAGE).unwrap();
        let _b = alloc.allocate(4 * PAGE).unwrap();
        alloc.free(a.offset, a.length);

        let c = alloc.allocate(4 * PAGE).unwrap();
        assert_eq!(c.offset, a.offset);
        alloc.check_consistency().unwrap();
    }

    #[test]
    fn test_allocate_free_round_trip_restores_state() {
        let alloc = fresh(2048);
        let before: Vec<u64> = alloc.state.read().level0.clone();
        let before_l1: Vec<u64> = alloc.state.read().level1.clone();

        let ext = alloc.allocate(1_048_576).unwrap();
        assert_eq!(ext.offset, 0);
        assert_eq!(ext.length, 1_048_576);
        alloc.free(ext.offset, ext.length);

        assert_eq!(alloc.allocated_bytes(), 0);
        assert_eq!(alloc.state.read().level0, before);
        assert_eq!(alloc.state.read().level1, before_l1);
    }

    #[test]
    fn test_fragmentation_blocks_long_runs() {
        let alloc = fresh(64);
        let mut extents = Vec::new();
        for _ in 0..64 {
            extents.push(alloc.allocate(PAGE).unwrap());
        }

        // Free every other page: plenty of space, no 2-page run.
        for ext in extents.iter().step_by(2) {
            alloc.free(ext.offset, ext.length);
        }
        assert_eq!(alloc.allocated_bytes(), 32 * PAGE);

        assert!(matches!(
            alloc.allocate(2 * PAGE),
            Err(SegspaceError::NoContiguousRun { pages: 2 })
        ));
        // Single pages still fit.
        alloc.allocate(PAGE).unwrap();
        alloc.check_consistency().unwrap();
    }

    #[test]
    fn test_run_crosses_word_boundary() {
        let alloc = fresh(128);
        // Occupy pages 0..60, leaving a run that spans the first word edge.
        let head = alloc.allocate(60 * PAGE).unwrap();
        let run = alloc.allocate(8 * PAGE).unwrap();
        assert_eq!(run.offset, 60 * PAGE);
        alloc.free(head.offset, head.length);
        alloc.check_consistency().unwrap();
    }

    #[test]
    fn test_run_crosses_unit_set_boundary() {
        let alloc = fresh(2048);
        let head = alloc.allocate(500 * PAGE).unwrap();
        // 24 pages straddle the 512-page unit-set edge.
        let run = alloc.allocate(24 * PAGE).unwrap();
        assert_eq!(run.offset, 500 * PAGE);
        alloc.free(head.offset, head.length);
        alloc.check_consistency().unwrap();
    }

    #[test]
    fn test_cursor_wraps_to_reclaimed_space() {
        let alloc = fresh(16);
        let a = alloc.allocate(8 * PAGE).unwrap();
        let _b = alloc.allocate(8 * PAGE).unwrap();

        // Cursor now sits at capacity; the only space is behind it.
        alloc.free(a.offset, a.length);
        let c = alloc.allocate(8 * PAGE).unwrap();
        assert_eq!(c.offset, 0);
        alloc.check_consistency().unwrap();
    }

    #[test]
    fn test_level1_clears_when_unit_set_fills() {
        let alloc = fresh(1024);
        let ext = alloc.allocate(512 * PAGE).unwrap();
        {
            let state = alloc.state.read();
            assert!(!state.l1_has_free(0));
            assert!(state.l1_has_free(1));
        }
        alloc.free(ext.offset, ext.length);
        assert!(alloc.state.read().l1_has_free(0));
        alloc.check_consistency().unwrap();
    }

    #[test]
    fn test_partial_tail_unit_set() {
        // 700 pages: one full unit-set plus a 188-page tail.
        let alloc = fresh(700);
        alloc.check_consistency().unwrap();

        let all = alloc.allocate(700 * PAGE).unwrap();
        assert_eq!(all.offset, 0);
        assert_eq!(alloc.utilization(), 1.0);
        alloc.check_consistency().unwrap();

        // Nothing past the tail may ever be handed out.
        assert!(alloc.allocate(PAGE).is_err());
        alloc.free(all.offset, all.length);
        alloc.check_consistency().unwrap();
    }

    #[test]
    fn test_free_normalises_unaligned_input() {
        let alloc = fresh(16);
        let ext = alloc.allocate(4 * PAGE).unwrap();

        // Offset rounds down, end rounds up; the whole extent comes back.
        alloc.free(ext.offset + 100, ext.length - 200);
        assert_eq!(alloc.allocated_bytes(), 0);
        alloc.check_consistency().unwrap();
    }

    #[test]
    fn test_double_free_clamps_counter() {
        let alloc = fresh(4);
        let ext = alloc.allocate(4 * PAGE).unwrap();
        alloc.free(ext.offset, ext.length);
        alloc.free(ext.offset, ext.length);
        assert_eq!(alloc.allocated_bytes(), 0);

        // Bits stay free; a fresh allocation still works.
        let again = alloc.allocate(4 * PAGE).unwrap();
        assert_eq!(again.offset, ext.offset);
    }

    #[test]
    fn test_free_out_of_range_is_clamped() {
        let alloc = fresh(16);
        alloc.free(1 << 40, 1 << 40);
        assert_eq!(alloc.allocated_bytes(), 0);
        alloc.check_consistency().unwrap();
    }

    #[test]
    fn test_metadata_bytes_one_tebibyte() {
        let alloc = BitmapAllocator::new(1 << 40, 4096);
        assert_eq!(alloc.total_pages(), 1 << 28);
        // 4 Mi level-0 words + 8 Ki level-1 words, 8 bytes each.
        assert_eq!(alloc.metadata_bytes(), 8 * (4_194_304 + 8_192));
        assert_eq!(alloc.allocated_bytes(), 0);
    }

    #[test]
    fn test_zero_capacity() {
        let alloc = BitmapAllocator::new(0, 4096);
        assert_eq!(alloc.utilization(), 0.0);
        assert!(matches!(
            alloc.allocate(1),
            Err(SegspaceError::InsufficientSpace { .. })
        ));
        alloc.check_consistency().unwrap();
    }

    #[test]
    fn test_summary_skips_do_not_miss_tail_space() {
        // Fill everything, then free a window deep in the range; the scan
        // has to skip whole unit-sets via level 1 to find it.
        let alloc = fresh(4096);
        let all = alloc.allocate(4096 * PAGE).unwrap();
        alloc.free(3000 * PAGE, 64 * PAGE);

        let ext = alloc.allocate(64 * PAGE).unwrap();
        assert_eq!(ext.offset, 3000 * PAGE);
        alloc.free(all.offset, 3000 * PAGE);
        alloc.free(3064 * PAGE, all.end() - 3064 * PAGE);
        assert_eq!(alloc.allocated_bytes(), 64 * PAGE);
        alloc.check_consistency().unwrap();
    }
}
