//! Structural changes to a loaded tree.
//!
//! Growth allocates blocks along the growing edge and, when the reference
//! can no longer hold enough inline ids, wraps the current roots in a new
//! level. Shrinking frees every block that falls outside the kept range,
//! then shifts the inline ids left and drops levels until the shape matches
//! what the new end offset implies.

use lvs_cache::{BlockBuf, Transaction};
use lvs_types::{BlockId, BlockSize};
use tracing::debug;

use crate::error::LargeBufResult;
use crate::format;
use crate::node::{leaf_at_mut, BufTree, Roots};
use crate::reference::LargeBufRef;
use crate::shape::{
    ceil_div, child_slots, internal_kids, leaf_bytes, max_offset, num_sublevels, overlaps,
    InlineLimit,
};

/// Mutable view over a controller's reference and loaded roots.
pub(crate) struct TreeEditor<'e, T: Transaction> {
    txn: &'e T,
    block_size: BlockSize,
    limit: InlineLimit,
    reference: &'e mut LargeBufRef,
    roots: &'e mut Roots<T::Buf>,
    num_bufs: &'e mut i64,
    levels: u32,
}

impl<'e, T: Transaction> TreeEditor<'e, T> {
    pub(crate) fn new(
        txn: &'e T,
        limit: InlineLimit,
        reference: &'e mut LargeBufRef,
        roots: &'e mut Roots<T::Buf>,
        num_bufs: &'e mut i64,
    ) -> Self {
        let block_size = txn.block_size();
        let levels = num_sublevels(block_size, reference.end_offset(), limit);
        Self {
            txn,
            block_size,
            limit,
            reference,
            roots,
            num_bufs,
            levels,
        }
    }

    fn span(&self) -> i64 {
        max_offset(self.block_size, self.levels)
    }

    fn kids(&self) -> usize {
        internal_kids(self.block_size) as usize
    }

    fn refsize(&self) -> usize {
        self.reference.refsize(self.block_size, self.limit)
    }

    /// Build a tree for `size` bytes under an empty reference.
    pub(crate) fn allocate(&mut self, size: i64) -> LargeBufResult<()> {
        self.levels = num_sublevels(self.block_size, size, self.limit);
        let span = self.span();
        for k in 0..ceil_div(size, span) {
            let tree = self.allocate_subtree(self.levels, k * span, 0, size)?;
            self.reference.ids.push(tree.block_id());
            self.roots.push(Some(tree));
        }
        self.reference.offset = 0;
        self.reference.size = size;
        debug!(size, levels = self.levels, roots = self.reference.ids.len(), "allocated large buffer");
        Ok(())
    }

    pub(crate) fn append(&mut self, extra: i64) -> LargeBufResult<isize> {
        let before = self.refsize();
        let o = self.reference.offset;
        let e = self.reference.end_offset();
        let new_e = e + extra;

        let needed = num_sublevels(self.block_size, new_e, self.limit);
        while self.levels < needed {
            self.add_level(0)?;
        }
        self.grow_roots(e, new_e, o, e)?;
        self.reference.size += extra;
        Ok(self.refsize() as isize - before as isize)
    }

    pub(crate) fn prepend(&mut self, extra: i64) -> LargeBufResult<isize> {
        let before = self.refsize();
        let mut o = self.reference.offset;
        let mut e = self.reference.end_offset();

        // Make room on the left by whole root spans: shift the inline ids
        // when they still fit, otherwise place the old roots further right
        // inside a new level.
        while extra > o {
            let span = self.span();
            let shift = ceil_div(extra - o, span);
            let roots = self.reference.ids.len() as i64 + shift;
            if roots <= self.limit.get() as i64 {
                self.shift_right(shift as usize);
            } else if roots <= self.kids() as i64 {
                self.add_level(shift as usize)?;
            } else {
                self.add_level(0)?;
                continue;
            }
            o += shift * span;
            e += shift * span;
        }

        self.grow_roots(o - extra, o, o, e)?;
        self.reference.offset = o - extra;
        self.reference.size += extra;
        Ok(self.refsize() as isize - before as isize)
    }

    pub(crate) fn unappend(&mut self, extra: i64) -> isize {
        let before = self.refsize();
        let o = self.reference.offset;
        let e = self.reference.end_offset();
        let new_e = e - extra;

        self.trim_roots(o, new_e, o, e);
        let keep = ceil_div(new_e, self.span()) as usize;
        debug_assert!(self.reference.ids[keep..].iter().all(|id| id.is_null()));
        self.reference.ids.truncate(keep);
        self.roots.truncate(keep);
        self.reference.size -= extra;

        self.rebalance();
        self.refsize() as isize - before as isize
    }

    pub(crate) fn unprepend(&mut self, extra: i64) -> isize {
        let before = self.refsize();
        let o = self.reference.offset;
        let e = self.reference.end_offset();

        self.trim_roots(o + extra, e, o, e);
        self.reference.offset += extra;
        self.reference.size -= extra;

        self.rebalance();
        self.refsize() as isize - before as isize
    }

    /// Copy `data` into the leaves starting at logical position `pos`.
    pub(crate) fn fill_at(&mut self, pos: i64, data: &[u8]) {
        let leaf_len = leaf_bytes(self.block_size);
        let mut abs = self.reference.offset + pos;
        let mut rest = data;
        while !rest.is_empty() {
            let within = (abs % leaf_len) as usize;
            let n = rest.len().min(leaf_len as usize - within);
            let leaf = leaf_at_mut(self.roots, self.block_size, self.levels, abs);
            leaf.leaf_payload_mut()[within..within + n].copy_from_slice(&rest[..n]);
            rest = &rest[n..];
            abs += n as i64;
        }
    }

    fn allocate_subtree(
        &mut self,
        level: u32,
        base: i64,
        lo: i64,
        hi: i64,
    ) -> LargeBufResult<Box<BufTree<T::Buf>>> {
        let mut buf = self.txn.allocate()?;
        format::init_block(buf.data_mut(), level);
        *self.num_bufs += 1;
        let mut node = Box::new(BufTree::new(buf, level, self.kids()));
        if level > 1 {
            let child_span = max_offset(self.block_size, level - 1);
            for slot in child_slots(self.block_size, level, base, lo, hi) {
                match self.allocate_subtree(level - 1, base + slot as i64 * child_span, lo, hi) {
                    Ok(child) => node.attach(slot, child),
                    Err(err) => {
                        self.free_subtree(node);
                        return Err(err);
                    }
                }
            }
        }
        Ok(node)
    }

    /// Allocate whatever `[lo, hi)` needs below `node`. Children that also
    /// hold part of `[old_lo, old_hi)` already exist and must be loaded.
    fn extend_subtree(
        &mut self,
        node: &mut BufTree<T::Buf>,
        base: i64,
        lo: i64,
        hi: i64,
        old_lo: i64,
        old_hi: i64,
    ) -> LargeBufResult<()> {
        if node.is_leaf() {
            return Ok(());
        }
        let level = node.level();
        let child_span = max_offset(self.block_size, level - 1);
        for slot in child_slots(self.block_size, level, base, lo, hi) {
            let child_base = base + slot as i64 * child_span;
            if overlaps(child_base, child_base + child_span, old_lo, old_hi) {
                let id = node.kid_id(slot);
                let Some(child) = node.child_mut(slot) else {
                    panic!("block {id} on the growing edge is not loaded");
                };
                self.extend_subtree(child, child_base, lo, hi, old_lo, old_hi)?;
            } else {
                let child = self.allocate_subtree(level - 1, child_base, lo, hi)?;
                node.attach(slot, child);
            }
        }
        Ok(())
    }

    fn grow_roots(&mut self, lo: i64, hi: i64, old_lo: i64, old_hi: i64) -> LargeBufResult<()> {
        let span = self.span();
        let first = (lo / span) as usize;
        let last = ((hi - 1) / span) as usize;
        for k in first..=last {
            if k >= self.reference.ids.len() {
                self.reference.ids.push(BlockId::NULL);
                self.roots.push(None);
            }
            let id = self.reference.ids[k];
            if id.is_null() {
                let tree = self.allocate_subtree(self.levels, k as i64 * span, lo, hi)?;
                self.reference.ids[k] = tree.block_id();
                self.roots[k] = Some(tree);
            } else {
                let Some(mut root) = self.roots[k].take() else {
                    panic!("root {id} on the growing edge is not loaded");
                };
                let result = self.extend_subtree(&mut root, k as i64 * span, lo, hi, old_lo, old_hi);
                self.roots[k] = Some(root);
                result?;
            }
        }
        Ok(())
    }

    /// Free whatever part of `[old_lo, old_hi)` is outside `[keep_lo, keep_hi)`.
    fn trim_roots(&mut self, keep_lo: i64, keep_hi: i64, old_lo: i64, old_hi: i64) {
        let span = self.span();
        for k in 0..self.reference.ids.len() {
            let id = self.reference.ids[k];
            if id.is_null() {
                continue;
            }
            let base = k as i64 * span;
            let (a, b) = (base.max(old_lo), (base + span).min(old_hi));
            if !overlaps(a, b, keep_lo, keep_hi) {
                let Some(root) = self.roots[k].take() else {
                    panic!("root {id} to be freed is not loaded");
                };
                self.free_subtree(root);
                self.reference.ids[k] = BlockId::NULL;
            } else if a < keep_lo || b > keep_hi {
                let Some(mut root) = self.roots[k].take() else {
                    panic!("root {id} on the trimmed edge is not loaded");
                };
                self.trim_subtree(&mut root, base, keep_lo, keep_hi, old_lo, old_hi);
                self.roots[k] = Some(root);
            }
        }
    }

    fn trim_subtree(
        &mut self,
        node: &mut BufTree<T::Buf>,
        base: i64,
        keep_lo: i64,
        keep_hi: i64,
        old_lo: i64,
        old_hi: i64,
    ) {
        if node.is_leaf() {
            return;
        }
        let level = node.level();
        let child_span = max_offset(self.block_size, level - 1);
        for slot in child_slots(self.block_size, level, base, old_lo, old_hi) {
            let child_base = base + slot as i64 * child_span;
            let (a, b) = (child_base.max(old_lo), (child_base + child_span).min(old_hi));
            let id = node.kid_id(slot);
            if !overlaps(a, b, keep_lo, keep_hi) {
                let Some(child) = node.detach(slot) else {
                    panic!("block {id} to be freed is not loaded");
                };
                self.free_subtree(child);
            } else if a < keep_lo || b > keep_hi {
                let Some(child) = node.child_mut(slot) else {
                    panic!("block {id} on the trimmed edge is not loaded");
                };
                self.trim_subtree(child, child_base, keep_lo, keep_hi, old_lo, old_hi);
            }
        }
    }

    fn free_subtree(&mut self, mut node: Box<BufTree<T::Buf>>) {
        node.mark_deleted();
        *self.num_bufs -= node.teardown();
    }

    /// Wrap the current roots in a new internal block, starting at child
    /// slot `first`.
    fn add_level(&mut self, first: usize) -> LargeBufResult<()> {
        let level = self.levels + 1;
        assert!(
            first + self.reference.ids.len() <= self.kids(),
            "too many roots to wrap"
        );

        let mut buf = self.txn.allocate()?;
        format::init_block(buf.data_mut(), level);
        *self.num_bufs += 1;
        let mut root = Box::new(BufTree::new(buf, level, self.kids()));

        let ids = std::mem::take(&mut self.reference.ids);
        let roots = std::mem::take(self.roots);
        for (j, (id, tree)) in ids.into_iter().zip(roots).enumerate() {
            root.adopt(first + j, id, tree);
        }

        let root_id = root.block_id();
        self.reference.ids = vec![root_id];
        *self.roots = vec![Some(root)];
        self.levels = level;
        debug!(levels = level, first, root = %root_id, "added large buffer level");
        Ok(())
    }

    /// Replace the single root with its children.
    fn remove_level(&mut self) {
        assert_eq!(self.reference.ids.len(), 1, "removing a level needs exactly one root");
        let root_id = self.reference.ids[0];
        let Some(mut root) = self.roots[0].take() else {
            panic!("root {root_id} must be loaded to remove a level");
        };

        let child_span = max_offset(self.block_size, self.levels - 1);
        let keep = ceil_div(self.reference.end_offset(), child_span) as usize;
        let ids: Vec<BlockId> = (0..keep).map(|slot| root.kid_id(slot)).collect();
        let mut children = root.take_children();
        debug_assert!(children[keep..].iter().all(Option::is_none));
        children.truncate(keep);

        root.buf_mut().mark_deleted();
        *self.num_bufs -= root.teardown();

        self.reference.ids = ids;
        *self.roots = children;
        self.levels -= 1;
        debug!(levels = self.levels, freed = %root_id, "removed large buffer level");
    }

    /// Insert `slots` vacant root slots at the front.
    fn shift_right(&mut self, slots: usize) {
        let mut ids = vec![BlockId::NULL; slots];
        ids.append(&mut self.reference.ids);
        self.reference.ids = ids;

        let mut roots: Roots<T::Buf> = (0..slots).map(|_| None).collect();
        roots.append(self.roots);
        *self.roots = roots;
        debug!(slots, "shifted inline ids right");
    }

    /// Drop vacant root slots from the front. Returns whether any moved.
    fn try_shifting(&mut self) -> bool {
        let span = self.span();
        let slots = (self.reference.offset / span) as usize;
        if slots == 0 {
            return false;
        }
        assert!(
            self.reference.ids[..slots].iter().all(|id| id.is_null()),
            "shifting out live roots"
        );
        self.reference.ids.drain(..slots);
        self.roots.drain(..slots);
        self.reference.offset -= slots as i64 * span;
        debug!(slots, "shifted inline ids left");
        true
    }

    /// Move a single root's children left past its vacant leading slots.
    fn try_shifting_kids(&mut self) -> bool {
        if self.levels < 2 || self.reference.ids.len() != 1 {
            return false;
        }
        let child_span = max_offset(self.block_size, self.levels - 1);
        let slots = (self.reference.offset / child_span) as usize;
        if slots == 0 {
            return false;
        }
        let root_id = self.reference.ids[0];
        let Some(root) = self.roots[0].as_deref_mut() else {
            panic!("root {root_id} must be loaded to shift its children");
        };
        root.shift_kids_left(slots);
        self.reference.offset -= slots as i64 * child_span;
        debug!(slots, root = %root_id, "shifted child ids left");
        true
    }

    fn rebalance(&mut self) {
        loop {
            let shifted = self.try_shifting() | self.try_shifting_kids();
            let mut removed = false;
            while num_sublevels(self.block_size, self.reference.end_offset(), self.limit) < self.levels {
                self.remove_level();
                removed = true;
            }
            if !shifted && !removed {
                break;
            }
        }
    }
}
