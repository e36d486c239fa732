//! Tree shape as a pure function of block size, end offset and inline limit.
//!
//! A value occupying absolute byte positions `[offset, offset + size)` is
//! stored in a tree whose depth depends only on the end offset
//! `offset + size`. Nothing here holds state: the same inputs give the same
//! shape whether a tree is being allocated or re-derived from a persisted
//! reference.

use std::fmt;
use std::ops::RangeInclusive;

use lvs_types::{BlockId, BlockMagic, BlockSize};

use crate::error::{LargeBufError, LargeBufResult};

/// Bytes taken by the `offset` and `size` fields of a serialized reference.
pub const REF_HEADER_LEN: usize = 16;

/// Payload bytes in one leaf block.
pub fn leaf_bytes(block_size: BlockSize) -> i64 {
    (block_size.bytes() - BlockMagic::LEN) as i64
}

/// Child slots in one internal block.
pub fn internal_kids(block_size: BlockSize) -> i64 {
    ((block_size.bytes() - BlockMagic::LEN) / BlockId::SERIALIZED_LEN) as i64
}

/// Largest end offset a tree of `levels` levels can address. Saturates at
/// `i64::MAX`.
pub fn max_offset(block_size: BlockSize, levels: u32) -> i64 {
    if levels == 0 {
        return 0;
    }
    let kids = internal_kids(block_size);
    let mut max = leaf_bytes(block_size);
    for _ in 1..levels {
        max = max.saturating_mul(kids);
    }
    max
}

/// Smallest level count whose single root can address `end_offset`.
pub fn num_levels(block_size: BlockSize, end_offset: i64) -> u32 {
    assert!(end_offset >= 0, "negative end offset {end_offset}");
    let mut levels = 0;
    while max_offset(block_size, levels) < end_offset {
        levels += 1;
    }
    levels
}

/// Depth of the subtrees rooted at the inline ids of a reference: the
/// smallest level count for which `limit` roots side by side reach
/// `end_offset`.
pub fn num_sublevels(block_size: BlockSize, end_offset: i64, limit: InlineLimit) -> u32 {
    assert!(end_offset >= 0, "negative end offset {end_offset}");
    let roots = limit.get() as i64;
    let mut levels = 0;
    while max_offset(block_size, levels).saturating_mul(roots) < end_offset {
        levels += 1;
    }
    levels
}

/// Number of ids stored inline in a reference.
pub fn num_inlined(block_size: BlockSize, end_offset: i64, limit: InlineLimit) -> usize {
    if end_offset == 0 {
        return 0;
    }
    let span = max_offset(block_size, num_sublevels(block_size, end_offset, limit));
    ceil_div(end_offset, span) as usize
}

/// Serialized length of a reference in bytes.
pub fn refsize(block_size: BlockSize, end_offset: i64, limit: InlineLimit) -> usize {
    REF_HEADER_LEN + BlockId::SERIALIZED_LEN * num_inlined(block_size, end_offset, limit)
}

pub(crate) fn ceil_div(a: i64, b: i64) -> i64 {
    a / b + i64::from(a % b != 0)
}

pub(crate) fn overlaps(a_lo: i64, a_hi: i64, b_lo: i64, b_hi: i64) -> bool {
    a_lo < b_hi && b_lo < a_hi
}

/// Child slots of a `level` node starting at `base` whose spans intersect
/// `[lo, hi)`. The range must intersect the node itself.
pub(crate) fn child_slots(
    block_size: BlockSize,
    level: u32,
    base: i64,
    lo: i64,
    hi: i64,
) -> RangeInclusive<usize> {
    debug_assert!(level > 1);
    let child_span = max_offset(block_size, level - 1);
    let kids = internal_kids(block_size);
    let end = base.saturating_add(child_span.saturating_mul(kids));
    let first = ((lo.max(base) - base) / child_span).min(kids - 1);
    let last = ((hi.min(end) - 1 - base) / child_span).min(kids - 1);
    first as usize..=last as usize
}

/// Maximum number of block ids a reference may hold inline.
///
/// Always at least 1 and at most the internal fan-out of the block size it
/// was validated against, so a tree only ever gains or loses one root at a
/// time when its depth changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InlineLimit(usize);

impl InlineLimit {
    pub fn new(limit: usize, block_size: BlockSize) -> LargeBufResult<Self> {
        if limit == 0 {
            return Err(LargeBufError::InvalidInlineLimit {
                limit,
                reason: "must be at least 1".into(),
            });
        }
        let kids = internal_kids(block_size) as usize;
        if limit > kids {
            return Err(LargeBufError::InvalidInlineLimit {
                limit,
                reason: format!("exceeds the internal fan-out of {kids} for {block_size} blocks"),
            });
        }
        Ok(Self(limit))
    }

    /// The largest limit whose serialized reference fits in `budget` bytes,
    /// capped at the internal fan-out.
    pub fn from_byte_budget(budget: usize, block_size: BlockSize) -> LargeBufResult<Self> {
        let limit = budget.saturating_sub(REF_HEADER_LEN) / BlockId::SERIALIZED_LEN;
        Self::new(limit.min(internal_kids(block_size) as usize), block_size)
    }

    pub const fn get(self) -> usize {
        self.0
    }

    /// Whether this limit is usable with `block_size`.
    pub fn fits(self, block_size: BlockSize) -> bool {
        self.0 as i64 <= internal_kids(block_size)
    }
}

impl fmt::Display for InlineLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
