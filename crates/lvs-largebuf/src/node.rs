use lvs_cache::BlockBuf;
use lvs_types::{BlockId, BlockSize};

use crate::format;
use crate::shape::max_offset;

/// Top-level subtrees of a large buffer, one slot per inline id. A `None`
/// slot is either outside the loaded range or vacated.
pub type Roots<B> = Vec<Option<Box<BufTree<B>>>>;

/// One acquired block of a large buffer tree and the loaded part of the
/// subtree below it.
///
/// A node exclusively owns its children. Internal nodes keep one child slot
/// per entry of the block's id array; slots that were not acquired stay
/// `None` even when the block names a child there.
pub struct BufTree<B> {
    level: u32,
    buf: B,
    children: Vec<Option<Box<BufTree<B>>>>,
}

impl<B: BlockBuf> BufTree<B> {
    pub(crate) fn new(buf: B, level: u32, kids: usize) -> Self {
        debug_assert!(level >= 1);
        let children = if level > 1 {
            (0..kids).map(|_| None).collect()
        } else {
            Vec::new()
        };
        Self {
            level,
            buf,
            children,
        }
    }

    /// Height above the leaves; leaves are level 1.
    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 1
    }

    pub fn block_id(&self) -> BlockId {
        self.buf.block_id()
    }

    pub fn buf(&self) -> &B {
        &self.buf
    }

    pub(crate) fn buf_mut(&mut self) -> &mut B {
        &mut self.buf
    }

    /// Child id stored in the block at `slot`.
    pub fn kid_id(&self, slot: usize) -> BlockId {
        debug_assert!(!self.is_leaf());
        format::kid_id(self.buf.data(), slot)
    }

    pub fn child(&self, slot: usize) -> Option<&BufTree<B>> {
        self.children.get(slot).and_then(|c| c.as_deref())
    }

    pub(crate) fn child_mut(&mut self, slot: usize) -> Option<&mut BufTree<B>> {
        self.children.get_mut(slot).and_then(|c| c.as_deref_mut())
    }

    /// Record `id` at `slot` and hold `child` (if loaded) for it.
    pub(crate) fn adopt(&mut self, slot: usize, id: BlockId, child: Option<Box<BufTree<B>>>) {
        format::set_kid_id(self.buf.data_mut(), slot, id);
        self.children[slot] = child;
    }

    pub(crate) fn attach(&mut self, slot: usize, child: Box<BufTree<B>>) {
        let id = child.block_id();
        self.adopt(slot, id, Some(child));
    }

    /// Null out `slot`, handing back the child if it was loaded.
    pub(crate) fn detach(&mut self, slot: usize) -> Option<Box<BufTree<B>>> {
        format::set_kid_id(self.buf.data_mut(), slot, BlockId::NULL);
        self.children[slot].take()
    }

    pub(crate) fn set_child(&mut self, slot: usize, child: Option<Box<BufTree<B>>>) {
        self.children[slot] = child;
    }

    /// Move every child `slots` places left. The vacated leading slots must
    /// already be null.
    pub(crate) fn shift_kids_left(&mut self, slots: usize) {
        let kids = self.children.len();
        assert!(
            (0..slots).all(|slot| self.kid_id(slot).is_null()),
            "shifting out live children of block {}",
            self.block_id()
        );
        let ids: Vec<BlockId> = (0..kids).map(|slot| self.kid_id(slot)).collect();
        let data = self.buf.data_mut();
        for slot in 0..kids {
            let id = ids.get(slot + slots).copied().unwrap_or(BlockId::NULL);
            format::set_kid_id(data, slot, id);
        }
        self.children.drain(..slots);
        self.children.extend((0..slots).map(|_| None));
    }

    pub(crate) fn take_children(&mut self) -> Vec<Option<Box<BufTree<B>>>> {
        std::mem::take(&mut self.children)
    }

    pub fn leaf_payload(&self) -> &[u8] {
        debug_assert!(self.is_leaf());
        format::leaf_payload(self.buf.data())
    }

    pub(crate) fn leaf_payload_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.is_leaf());
        format::leaf_payload_mut(self.buf.data_mut())
    }

    /// Number of acquired blocks in this subtree.
    pub fn loaded_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .flatten()
            .map(|c| c.loaded_count())
            .sum::<usize>()
    }

    /// Mark every block of this subtree deleted. Every child the block names
    /// must be loaded.
    pub(crate) fn mark_deleted(&mut self) {
        if !self.is_leaf() {
            for slot in 0..self.children.len() {
                let id = self.kid_id(slot);
                if id.is_null() {
                    continue;
                }
                match self.child_mut(slot) {
                    Some(child) => child.mark_deleted(),
                    None => panic!("cannot delete block {id}: it was not acquired"),
                }
            }
        }
        self.buf.mark_deleted();
    }

    /// Return this subtree's blocks to the cache, children first. Returns how
    /// many buffers were given back.
    pub(crate) fn teardown(self: Box<Self>) -> i64 {
        let BufTree { buf, children, .. } = *self;
        let mut released = 1;
        for child in children.into_iter().flatten() {
            released += child.teardown();
        }
        drop(buf);
        released
    }
}

/// Leaf holding absolute position `pos`. Panics if any block on the path
/// was not acquired.
pub(crate) fn leaf_at<B: BlockBuf>(
    roots: &[Option<Box<BufTree<B>>>],
    block_size: BlockSize,
    levels: u32,
    pos: i64,
) -> &BufTree<B> {
    let span = max_offset(block_size, levels);
    let k = (pos / span) as usize;
    let Some(mut node) = roots.get(k).and_then(|r| r.as_deref()) else {
        panic!("root {k} holding position {pos} is not loaded");
    };
    let mut base = k as i64 * span;
    while !node.is_leaf() {
        let child_span = max_offset(block_size, node.level - 1);
        let slot = ((pos - base) / child_span) as usize;
        base += slot as i64 * child_span;
        let Some(child) = node.child(slot) else {
            panic!("block {} holding position {pos} is not loaded", node.kid_id(slot));
        };
        node = child;
    }
    node
}

/// Mutable counterpart of [`leaf_at`].
pub(crate) fn leaf_at_mut<B: BlockBuf>(
    roots: &mut [Option<Box<BufTree<B>>>],
    block_size: BlockSize,
    levels: u32,
    pos: i64,
) -> &mut BufTree<B> {
    let span = max_offset(block_size, levels);
    let k = (pos / span) as usize;
    let mut node = match roots.get_mut(k).and_then(|r| r.as_deref_mut()) {
        Some(node) => node,
        None => panic!("root {k} holding position {pos} is not loaded"),
    };
    let mut base = k as i64 * span;
    while !node.is_leaf() {
        let child_span = max_offset(block_size, node.level - 1);
        let slot = ((pos - base) / child_span) as usize;
        base += slot as i64 * child_span;
        let id = node.kid_id(slot);
        node = match node.child_mut(slot) {
            Some(child) => child,
            None => panic!("block {id} holding position {pos} is not loaded"),
        };
    }
    node
}
