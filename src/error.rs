use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegspaceError {
    #[error("zero-length allocation request")]
    ZeroRequest,

    #[error("insufficient free space: requested {requested} bytes, {available} available")]
    InsufficientSpace { requested: u64, available: u64 },

    #[error("no contiguous run of {pages} free pages")]
    NoContiguousRun { pages: u64 },

    #[error("invalid magic number in superblock")]
    InvalidMagic,

    #[error("unsupported segment version: {0}")]
    UnsupportedVersion(u64),

    #[error("invalid page size: {0}")]
    InvalidPageSize(u32),

    #[error("unknown block file: {0}")]
    UnknownBlockFile(String),

    #[error("allocator metadata inconsistent: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SegspaceError>;
