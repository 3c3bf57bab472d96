//! Block files and their on-segment metadata
//!
//! A block file is a named, append-only sequence of page-aligned extents
//! inside the segment's data region. The segment keeps the authoritative
//! extent list in memory and journals it through the inode log.

use crate::allocator::Extent;
use serde::{Deserialize, Serialize};

/// One contiguous piece of a block file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExtent {
    /// Byte offset within the data region
    pub offset: u64,
    /// Length in bytes (page multiple)
    pub length: u64,
    /// First logical page of the file covered by this extent
    pub page_offset: u64,
    /// Number of pages covered
    pub page_count: u64,
}

impl FileExtent {
    /// One past the last byte of this extent
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// One past the last logical page covered
    pub fn page_end(&self) -> u64 {
        self.page_offset + self.page_count
    }
}

/// Per-file metadata node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inode {
    /// Stable file identifier within the segment
    pub ino: u64,
    /// Logical file size in bytes (sum of extent lengths)
    pub size: u64,
    /// Data extents in append order
    pub extents: Vec<FileExtent>,
    /// Where the latest journalled copy of this inode lives
    pub log_extent: Option<Extent>,
}

impl Inode {
    pub fn new(ino: u64) -> Self {
        Inode {
            ino,
            size: 0,
            extents: Vec::new(),
            log_extent: None,
        }
    }
}

/// A named block file inside a segment
#[derive(Debug, Clone)]
pub struct BlockFile {
    pub name: String,
    pub inode: Inode,
}

impl BlockFile {
    pub fn new(name: impl Into<String>, ino: u64) -> Self {
        BlockFile {
            name: name.into(),
            inode: Inode::new(ino),
        }
    }
}
