use lvs_cache::CacheError;
use lvs_types::{BlockId, BlockMagic, TypeError};

/// Errors from large buffer operations.
///
/// Programming errors (wrong state, touching a block that was never
/// acquired) are not represented here; those panic.
#[derive(Debug, thiserror::Error)]
pub enum LargeBufError {
    /// A loaded block does not carry the format tag expected at its level.
    #[error("corrupt block {block} at level {level}: expected magic {expected}, found {found}")]
    CorruptBlock {
        block: BlockId,
        level: u32,
        expected: BlockMagic,
        found: BlockMagic,
    },

    /// An internal block has a null id in a slot that the value covers.
    #[error("internal block {block} has no child in slot {slot}")]
    MissingChild { block: BlockId, slot: usize },

    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Serialized reference bytes are inconsistent with the block size and
    /// inline limit they are decoded under.
    #[error("malformed large buffer reference: {0}")]
    MalformedRef(String),

    #[error("invalid inline limit {limit}: {reason}")]
    InvalidInlineLimit { limit: usize, reason: String },

    #[error("invalid large buffer configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Result alias for large buffer operations.
pub type LargeBufResult<T> = Result<T, LargeBufError>;
