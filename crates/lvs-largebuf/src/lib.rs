//! Large values stored as trees of fixed-size blocks.
//!
//! A value too big for one block is kept in leaves of `block_size - 4`
//! payload bytes, grouped under internal blocks of `(block_size - 4) / 8`
//! child ids. The owning record embeds a [`LargeBufRef`]: the logical
//! window (`offset`, `size`) into the tree's absolute address space plus the
//! ids of the top-level subtrees, at most [`InlineLimit`] of them.
//!
//! ```text
//!   LargeBufRef { offset, size, ids: [r0, r1] }
//!                                      |    |
//!                            [lari r0] +    + [lari r1]
//!                             /  |  \          |   \
//!                        [larl] ... [larl]  [larl] [larl]
//! ```
//!
//! A [`LargeBuf`] controller acquires all or part of a tree through a
//! [`Transaction`](lvs_cache::Transaction), then grows it at either end,
//! shrinks it, or reads and writes it segment by segment. Every resize
//! returns the change in the reference's serialized size so the caller can
//! adjust the record holding it.
//!
//! # Rules
//!
//! 1. Only blocks that intersect `[offset, offset + size)` exist; every
//!    other child slot holds the null id.
//! 2. Inline id `k` covers absolute positions `[k * S, (k + 1) * S)` where
//!    `S` is the span of one top-level subtree, and `offset < S`.
//! 3. The tree depth is always the smallest that fits the end offset in the
//!    inline limit.
//! 4. Every byte a resize touches, and the byte at each new edge, must have
//!    been acquired for writing beforehand.

mod acquire;
pub mod config;
pub mod error;
pub mod format;
pub mod large_buf;
mod mutate;
pub mod node;
pub mod reference;
pub mod segment;
pub mod shape;

#[cfg(test)]
mod test_support;

pub use config::{LargeBufConfig, StoreConfig};
pub use error::{LargeBufError, LargeBufResult};
pub use large_buf::{LargeBuf, State};
pub use node::BufTree;
pub use reference::LargeBufRef;
pub use shape::{
    internal_kids, leaf_bytes, max_offset, num_inlined, num_levels, num_sublevels, refsize,
    InlineLimit,
};
