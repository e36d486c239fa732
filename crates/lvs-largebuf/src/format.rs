//! On-block layout of large buffer trees.
//!
//! ```text
//! leaf:     [4 bytes: "larl"] [payload bytes ...]
//! internal: [4 bytes: "lari"] [8 bytes per child id (little-endian u64)] ...
//! ```
//!
//! Child slots that do not intersect the value hold the null id.

use lvs_types::{BlockId, BlockMagic};

use crate::error::{LargeBufError, LargeBufResult};

pub const LEAF_MAGIC: BlockMagic = BlockMagic::new(*b"larl");
pub const INTERNAL_MAGIC: BlockMagic = BlockMagic::new(*b"lari");

/// Tag expected on a block at `level` (leaves are level 1).
pub fn expected_magic(level: u32) -> BlockMagic {
    if level == 1 {
        LEAF_MAGIC
    } else {
        INTERNAL_MAGIC
    }
}

/// Format a fresh block for `level`. Internal blocks start with every child
/// slot null.
pub fn init_block(data: &mut [u8], level: u32) {
    expected_magic(level).write_to(data);
    if level > 1 {
        for chunk in data[BlockMagic::LEN..].chunks_exact_mut(BlockId::SERIALIZED_LEN) {
            BlockId::NULL.write_to(chunk);
        }
    }
}

/// Verify the tag of a block loaded at `level`.
pub fn check_magic(data: &[u8], block: BlockId, level: u32) -> LargeBufResult<()> {
    let expected = expected_magic(level);
    let found = BlockMagic::read_from(data)?;
    if found != expected {
        return Err(LargeBufError::CorruptBlock {
            block,
            level,
            expected,
            found,
        });
    }
    Ok(())
}

fn kid_range(slot: usize) -> std::ops::Range<usize> {
    let start = BlockMagic::LEN + slot * BlockId::SERIALIZED_LEN;
    start..start + BlockId::SERIALIZED_LEN
}

pub fn kid_id(data: &[u8], slot: usize) -> BlockId {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[kid_range(slot)]);
    BlockId::from_le_bytes(raw)
}

pub fn set_kid_id(data: &mut [u8], slot: usize, id: BlockId) {
    id.write_to(&mut data[kid_range(slot)]);
}

pub fn leaf_payload(data: &[u8]) -> &[u8] {
    &data[BlockMagic::LEN..]
}

pub fn leaf_payload_mut(data: &mut [u8]) -> &mut [u8] {
    &mut data[BlockMagic::LEN..]
}
