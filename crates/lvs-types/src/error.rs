use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("block size {size} is below the minimum of {min} bytes")]
    BlockSizeTooSmall { size: u32, min: u32 },

    #[error("{0} is reserved for the null block id")]
    ReservedBlockId(u64),
}
