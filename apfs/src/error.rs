use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid magic: 0x{found:08X}")]
    InvalidMagic { found: u32 },

    #[error("object at block {block_nr}: checksum mismatch")]
    ChecksumMismatch { block_nr: u64 },

    #[error("object at block {block_nr}: expected object type {expected:#x}, found {found:#x}")]
    WrongObjectType { block_nr: u64, expected: u32, found: u32 },

    #[error("node at block {block_nr}: record_count is zero")]
    EmptyNode { block_nr: u64 },

    #[error("node at block {block_nr}: record-locator table overflows the header")]
    TableOverflow { block_nr: u64 },

    #[error("node at block {block_nr}, record {index}: locator out of bounds")]
    LocatorOutOfBounds { block_nr: u64, index: i64 },

    #[error("node at block {block_nr}: keys out of order")]
    OutOfOrder { block_nr: u64 },

    #[error("node at block {block_nr}: duplicate leaf key")]
    DuplicateLeafKey { block_nr: u64 },

    #[error("wrong child oid: separator named {expected}, child header has {actual}")]
    WrongChildOid { expected: u64, actual: u64 },

    #[error("node at block {block_nr}, record {index}: wrong value size")]
    WrongValueSize { block_nr: u64, index: i64 },

    #[error("b-tree too deep (beyond 12 levels)")]
    DepthOverflow,

    #[error("omap lookup failed: oid {oid} not found")]
    OmapLookupFailed { oid: u64 },

    #[error("container superblock has no volume")]
    NoVolume,

    #[error("catalog query requires an omap root to resolve child oids")]
    MissingOmapRoot,

    #[error("malformed data: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, ApfsError>;
