use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Identifier of a fixed-size storage block managed by the block cache.
///
/// Ids are serialized as little-endian `u64`. The all-ones value is reserved
/// as [`BlockId::NULL`], which marks unused child slots in internal blocks and
/// inline slots that have been vacated during a resize.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(u64);

impl BlockId {
    /// The null block id. Represents "no block".
    pub const NULL: BlockId = BlockId(u64::MAX);

    /// Number of bytes a serialized id occupies.
    pub const SERIALIZED_LEN: usize = 8;

    /// Wrap a raw id, rejecting the reserved null value.
    pub fn new(raw: u64) -> Result<Self, TypeError> {
        if raw == u64::MAX {
            return Err(TypeError::ReservedBlockId(raw));
        }
        Ok(Self(raw))
    }

    /// The raw numeric value.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns `true` if this is the null block id.
    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }

    /// Decode an id from the first [`SERIALIZED_LEN`](Self::SERIALIZED_LEN)
    /// bytes of `bytes`.
    pub fn read_from(bytes: &[u8]) -> Result<Self, TypeError> {
        if bytes.len() < Self::SERIALIZED_LEN {
            return Err(TypeError::InvalidLength {
                expected: Self::SERIALIZED_LEN,
                actual: bytes.len(),
            });
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[..Self::SERIALIZED_LEN]);
        Ok(Self::from_le_bytes(raw))
    }

    /// Encode this id into the first [`SERIALIZED_LEN`](Self::SERIALIZED_LEN)
    /// bytes of `out`.
    pub fn write_to(self, out: &mut [u8]) {
        out[..Self::SERIALIZED_LEN].copy_from_slice(&self.to_le_bytes());
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "BlockId(null)")
        } else {
            write!(f, "BlockId({})", self.0)
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Usable capacity of one storage block, in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct BlockSize(u32);

impl BlockSize {
    /// Smallest capacity that still fits a magic tag plus two child ids.
    pub const MIN: u32 = (BlockMagic::LEN + 2 * BlockId::SERIALIZED_LEN) as u32;

    pub fn new(bytes: u32) -> Result<Self, TypeError> {
        if bytes < Self::MIN {
            return Err(TypeError::BlockSizeTooSmall {
                size: bytes,
                min: Self::MIN,
            });
        }
        Ok(Self(bytes))
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// Capacity as a `usize`, for sizing buffers.
    pub const fn bytes(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<u32> for BlockSize {
    type Error = TypeError;

    fn try_from(bytes: u32) -> Result<Self, Self::Error> {
        Self::new(bytes)
    }
}

impl From<BlockSize> for u32 {
    fn from(size: BlockSize) -> Self {
        size.0
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}

/// Four-byte format tag at the start of every formatted block.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockMagic([u8; 4]);

impl BlockMagic {
    pub const LEN: usize = 4;

    pub const fn new(tag: [u8; 4]) -> Self {
        Self(tag)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Read the tag stored at the start of `block`.
    pub fn read_from(block: &[u8]) -> Result<Self, TypeError> {
        if block.len() < Self::LEN {
            return Err(TypeError::InvalidLength {
                expected: Self::LEN,
                actual: block.len(),
            });
        }
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&block[..Self::LEN]);
        Ok(Self(tag))
    }

    /// Stamp this tag at the start of `block`.
    pub fn write_to(&self, block: &mut [u8]) {
        block[..Self::LEN].copy_from_slice(&self.0);
    }
}

impl fmt::Debug for BlockMagic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockMagic({self})")
    }
}

impl fmt::Display for BlockMagic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0.escape_ascii())
    }
}
