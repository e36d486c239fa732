use lvs_types::{BlockId, BlockSize};
use serde::{Deserialize, Serialize};

use crate::error::{LargeBufError, LargeBufResult};
use crate::shape::{self, InlineLimit, REF_HEADER_LEN};

/// Compact handle to a large value, embedded in the record that owns it.
///
/// The value occupies absolute positions `[offset, offset + size)` of its
/// tree. `ids` are the roots of the top-level subtrees; inline id `k` covers
/// positions `[k * S, (k + 1) * S)` where `S` is the span of a subtree at the
/// depth given by [`shape::num_sublevels`].
///
/// Serialized layout:
/// ```text
/// [8 bytes: offset (little-endian i64)]
/// [8 bytes: size (little-endian i64)]
/// [8 bytes per inline id (little-endian u64)]
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LargeBufRef {
    pub offset: i64,
    pub size: i64,
    pub ids: Vec<BlockId>,
}

impl LargeBufRef {
    /// A reference to nothing, ready to be passed to allocation.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0 && self.offset == 0 && self.ids.is_empty()
    }

    pub fn end_offset(&self) -> i64 {
        self.offset + self.size
    }

    /// Serialized size implied by the block size and inline limit.
    pub fn refsize(&self, block_size: BlockSize, limit: InlineLimit) -> usize {
        shape::refsize(block_size, self.end_offset(), limit)
    }

    /// Length of [`encode`](Self::encode)'s output.
    pub fn encoded_len(&self) -> usize {
        REF_HEADER_LEN + BlockId::SERIALIZED_LEN * self.ids.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        for id in &self.ids {
            out.extend_from_slice(&id.to_le_bytes());
        }
        out
    }

    /// Decode a reference, checking that its length matches the refsize its
    /// header implies.
    pub fn decode(bytes: &[u8], block_size: BlockSize, limit: InlineLimit) -> LargeBufResult<Self> {
        if bytes.len() < REF_HEADER_LEN {
            return Err(LargeBufError::MalformedRef(format!(
                "{} bytes is shorter than the {REF_HEADER_LEN}-byte header",
                bytes.len()
            )));
        }
        let offset = read_i64(&bytes[0..8]);
        let size = read_i64(&bytes[8..16]);
        if offset < 0 || size < 0 {
            return Err(LargeBufError::MalformedRef(format!(
                "negative offset {offset} or size {size}"
            )));
        }
        let end = offset
            .checked_add(size)
            .ok_or_else(|| LargeBufError::MalformedRef("end offset overflows".into()))?;

        let expected = shape::refsize(block_size, end, limit);
        if bytes.len() != expected {
            return Err(LargeBufError::MalformedRef(format!(
                "expected {expected} bytes for end offset {end}, got {}",
                bytes.len()
            )));
        }

        let ids = bytes[REF_HEADER_LEN..]
            .chunks_exact(BlockId::SERIALIZED_LEN)
            .map(BlockId::read_from)
            .collect::<Result<Vec<_>, _>>()?;
        if ids.iter().any(|id| id.is_null()) {
            return Err(LargeBufError::MalformedRef("null inline id".into()));
        }
        if size > 0 {
            let span = shape::max_offset(block_size, shape::num_sublevels(block_size, end, limit));
            if offset >= span {
                return Err(LargeBufError::MalformedRef(format!(
                    "offset {offset} lies beyond the first root span of {span}"
                )));
            }
        }

        Ok(Self { offset, size, ids })
    }
}

fn read_i64(bytes: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    i64::from_le_bytes(raw)
}
