use lvs_types::{BlockId, TypeError};

/// Errors from block cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The requested block does not exist (never allocated, or freed).
    #[error("block not found: {0}")]
    BlockNotFound(BlockId),

    /// Every non-null block id has been handed out.
    #[error("block id space exhausted")]
    OutOfBlockIds,

    /// The cache already holds its configured maximum of live blocks.
    #[error("cache full: {limit} blocks in use")]
    Full { limit: usize },

    /// Configuration could not be parsed or is out of range.
    #[error("invalid cache configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
