//! # Segspace - Page-Granular Space Allocation for Storage Segments
//!
//! `segspace` manages free space inside a single flat storage region (a
//! "segment") of up to one tebibyte. It answers one question per request:
//! where in the segment can this many bytes be placed?
//!
//! - **Two-level bitmap allocator**: one level-0 bit per page (1 = free),
//!   one level-1 bit per 512-page unit-set so the search skips fully
//!   allocated space 2 MiB per summary bit, 128 MiB per summary word
//! - **First-fit with a rolling cursor** and a single wrap-around pass
//! - **Low overhead**: ~32 MiB of metadata for a 1 TiB segment at 4 KiB
//!   pages, allocated once, never on the hot path
//! - **Segment layer**: block files, inode journal, and a superblocked
//!   backing file that exercise the allocator end to end
//!
//! ## Quick Start
//!
//! ```rust
//! use segspace::{BitmapAllocator, SpaceAllocator};
//!
//! # fn main() -> segspace::Result<()> {
//! // 1 GiB of space in 4 KiB pages, all free.
//! let alloc = BitmapAllocator::new(1 << 30, 4096);
//!
//! // Sizes round up to whole pages.
//! let ext = alloc.allocate(10_000)?;
//! assert_eq!(ext.offset % 4096, 0);
//! assert_eq!(ext.length, 12_288);
//!
//! alloc.free(ext.offset, ext.length);
//! assert_eq!(alloc.allocated_bytes(), 0);
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod error;
pub mod segment;

pub use allocator::bitmap::BitmapAllocator;
pub use allocator::prealloc::{PreallocConfig, Preallocator};
pub use allocator::{Extent, SpaceAllocator};
pub use error::{Result, SegspaceError};
pub use segment::file::{BlockFile, FileExtent, Inode};
pub use segment::{Segment, SuperBlock, PAGE_SIZE};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
