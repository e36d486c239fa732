//! Recursive acquisition of the part of a tree that covers a byte range.
//!
//! Every block to be acquired gets a slot in an arena; the slot index is the
//! token handed to the cache with the block's waiter. A block that is ready
//! right away is processed inline, otherwise its delivery arrives later on
//! the acquirer's channel. Each internal node counts the children it is
//! still waiting for and completes exactly once, when that count reaches
//! zero; the acquisition as a whole finishes when every requested root has
//! completed. The arena is then folded into owned [`BufTree`]s.

use lvs_cache::{
    delivery_channel, Acquisition, BlockBuf, BlockWaiter, CacheResult, Delivery, DeliveryReceiver,
    DeliverySender, LoadMode, Transaction,
};
use lvs_types::{Access, BlockId, BlockSize};
use tracing::{debug, warn};

use crate::error::{LargeBufError, LargeBufResult};
use crate::format;
use crate::node::{BufTree, Roots};
use crate::shape::{child_slots, internal_kids, max_offset};

struct PendingNode<B> {
    parent: Option<usize>,
    /// Slot in the parent, or root index for top-level nodes.
    slot: usize,
    level: u32,
    /// Absolute position of the first byte this node's subtree can hold.
    base: i64,
    block: BlockId,
    buf: Option<B>,
    children: Vec<usize>,
    outstanding: i64,
    delivered: bool,
    completed: bool,
}

pub(crate) struct Acquirer<'t, T: Transaction> {
    txn: &'t T,
    block_size: BlockSize,
    access: Access,
    leaf_load: LoadMode,
    /// Absolute range whose blocks are wanted.
    lo: i64,
    hi: i64,
    nodes: Vec<PendingNode<T::Buf>>,
    tx: DeliverySender<T::Buf>,
    rx: DeliveryReceiver<T::Buf>,
    outstanding_roots: i64,
    error: Option<LargeBufError>,
}

impl<'t, T: Transaction> Acquirer<'t, T> {
    pub(crate) fn new(txn: &'t T, access: Access, leaf_load: LoadMode) -> Self {
        let (tx, rx) = delivery_channel();
        Self {
            txn,
            block_size: txn.block_size(),
            access,
            leaf_load,
            lo: 0,
            hi: 0,
            nodes: Vec::new(),
            tx,
            rx,
            outstanding_roots: 0,
            error: None,
        }
    }

    /// Acquire every block of the `levels`-deep subtrees rooted at `ids`
    /// that intersects absolute positions `[lo, hi)`.
    ///
    /// Returns one slot per inline id (unrequested roots are `None`) and the
    /// number of buffers now held. On failure every buffer that did arrive
    /// is returned to the cache before the first error is reported.
    pub(crate) async fn run(
        mut self,
        ids: &[BlockId],
        levels: u32,
        lo: i64,
        hi: i64,
    ) -> LargeBufResult<(Roots<T::Buf>, i64)> {
        assert!(lo < hi, "empty acquisition range [{lo}, {hi})");
        assert!(levels >= 1, "acquisition of an empty tree");
        self.lo = lo;
        self.hi = hi;

        let span = max_offset(self.block_size, levels);
        let first = (lo / span) as usize;
        let last = ((hi - 1) / span) as usize;
        assert!(last < ids.len(), "range [{lo}, {hi}) runs past root {}", ids.len());

        self.outstanding_roots = (last - first + 1) as i64;
        let mut root_nodes = Vec::with_capacity(last - first + 1);
        for k in first..=last {
            let idx = self.issue(None, k, levels, k as i64 * span, ids[k]);
            root_nodes.push((k, idx));
        }

        while self.outstanding_roots > 0 {
            match self.rx.recv().await {
                Some(delivery) => self.on_delivery(delivery),
                None => break,
            }
        }
        assert_eq!(self.outstanding_roots, 0, "acquisition stopped with roots outstanding");

        if let Some(err) = self.error.take() {
            warn!(error = %err, "large buffer acquisition failed");
            return Err(err);
        }

        let mut roots: Roots<T::Buf> = (0..ids.len()).map(|_| None).collect();
        let mut count = 0;
        for (k, idx) in root_nodes {
            let tree = self.assemble(idx);
            if let Some(tree) = &tree {
                count += tree.loaded_count() as i64;
            }
            roots[k] = tree;
        }
        debug!(levels, lo, hi, blocks = count, "acquired large buffer range");
        Ok((roots, count))
    }

    fn issue(
        &mut self,
        parent: Option<usize>,
        slot: usize,
        level: u32,
        base: i64,
        block: BlockId,
    ) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(PendingNode {
            parent,
            slot,
            level,
            base,
            block,
            buf: None,
            children: Vec::new(),
            outstanding: 0,
            delivered: false,
            completed: false,
        });
        if let Some(p) = parent {
            self.nodes[p].children.push(idx);
        }

        let load = if level == 1 {
            self.leaf_load
        } else {
            LoadMode::Contents
        };
        let waiter = BlockWaiter::new(idx, block, self.tx.clone());
        match self.txn.acquire(block, self.access, load, waiter) {
            Acquisition::Ready(result) => self.on_block(idx, result),
            Acquisition::Pending => {}
        }
        idx
    }

    fn on_delivery(&mut self, delivery: Delivery<T::Buf>) {
        let Delivery {
            token,
            block,
            result,
        } = delivery;
        assert!(token < self.nodes.len(), "delivery for unknown token {token}");
        assert_eq!(self.nodes[token].block, block, "delivery for the wrong block");
        self.on_block(token, result);
    }

    fn on_block(&mut self, idx: usize, result: CacheResult<T::Buf>) {
        let node = &mut self.nodes[idx];
        assert!(!node.delivered, "block {} delivered twice", node.block);
        node.delivered = true;
        let (block, level, base) = (node.block, node.level, node.base);

        let checked = result.map_err(LargeBufError::from).and_then(|buf| {
            if level > 1 || self.leaf_load == LoadMode::Contents {
                format::check_magic(buf.data(), block, level)?;
            }
            Ok(buf)
        });
        let buf = match checked {
            Ok(buf) => buf,
            Err(err) => {
                self.fail(err);
                self.complete(idx);
                return;
            }
        };

        if level == 1 {
            self.nodes[idx].buf = Some(buf);
            self.complete(idx);
            return;
        }

        let child_span = max_offset(self.block_size, level - 1);
        let mut wanted = Vec::new();
        for slot in child_slots(self.block_size, level, base, self.lo, self.hi) {
            let kid = format::kid_id(buf.data(), slot);
            if kid.is_null() {
                self.fail(LargeBufError::MissingChild { block, slot });
                continue;
            }
            wanted.push((slot, kid));
        }

        let node = &mut self.nodes[idx];
        node.buf = Some(buf);
        node.outstanding = wanted.len() as i64;
        if wanted.is_empty() {
            self.complete(idx);
            return;
        }
        for (slot, kid) in wanted {
            self.issue(Some(idx), slot, level - 1, base + slot as i64 * child_span, kid);
        }
    }

    fn fail(&mut self, err: LargeBufError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn complete(&mut self, idx: usize) {
        let node = &mut self.nodes[idx];
        assert!(!node.completed, "block {} completed twice", node.block);
        node.completed = true;
        let parent = node.parent;
        match parent {
            Some(p) => {
                let parent = &mut self.nodes[p];
                parent.outstanding -= 1;
                assert!(
                    parent.outstanding >= 0,
                    "block {} has a negative outstanding count",
                    parent.block
                );
                if parent.outstanding == 0 {
                    self.complete(p);
                }
            }
            None => {
                self.outstanding_roots -= 1;
                assert!(self.outstanding_roots >= 0, "negative outstanding root count");
            }
        }
    }

    fn assemble(&mut self, idx: usize) -> Option<Box<BufTree<T::Buf>>> {
        let node = &mut self.nodes[idx];
        let buf = node.buf.take()?;
        let level = node.level;
        let children = std::mem::take(&mut node.children);

        let mut tree = BufTree::new(buf, level, internal_kids(self.block_size) as usize);
        for child in children {
            let slot = self.nodes[child].slot;
            let subtree = self.assemble(child);
            tree.set_child(slot, subtree);
        }
        Some(Box::new(tree))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{build_tree, small_cache};
    use lvs_cache::{CacheError, CacheEvent, MemoryCache, MemoryTransaction};

    async fn acquire_range(
        cache: &MemoryCache,
        ids: &[BlockId],
        levels: u32,
        lo: i64,
        hi: i64,
    ) -> LargeBufResult<(Roots<lvs_cache::MemoryBuf>, i64)> {
        let txn = cache.begin();
        Acquirer::new(&txn, Access::Read, LoadMode::Contents)
            .run(ids, levels, lo, hi)
            .await
    }

    #[tokio::test]
    async fn full_range_loads_every_block() {
        let cache = small_cache();
        // Two levels, 4 leaves under one root.
        let ids = build_tree(&cache, 2, 0, 128);
        let (roots, count) = acquire_range(&cache, &ids, 2, 0, 128).await.unwrap();
        assert_eq!(count, 5);
        let root = roots[0].as_ref().unwrap();
        assert_eq!(root.level(), 2);
        for slot in 0..4 {
            assert!(root.child(slot).unwrap().is_leaf());
        }
    }

    #[tokio::test]
    async fn slice_loads_only_the_intersecting_path() {
        let cache = small_cache();
        let ids = build_tree(&cache, 2, 0, 128);
        let (roots, count) = acquire_range(&cache, &ids, 2, 127, 128).await.unwrap();
        assert_eq!(count, 2);
        let root = roots[0].as_ref().unwrap();
        assert!(root.child(0).is_none());
        assert!(root.child(3).is_some());
    }

    #[tokio::test]
    async fn unrequested_roots_stay_unloaded() {
        let cache = small_cache();
        // One level, two inline leaves.
        let ids = build_tree(&cache, 1, 0, 64);
        assert_eq!(ids.len(), 2);
        let (roots, count) = acquire_range(&cache, &ids, 1, 40, 41).await.unwrap();
        assert_eq!(count, 1);
        assert!(roots[0].is_none());
        assert!(roots[1].is_some());
    }

    #[tokio::test]
    async fn internal_block_is_read_before_leaves() {
        let cache = small_cache();
        let ids = build_tree(&cache, 2, 0, 100);
        cache.take_events();
        acquire_range(&cache, &ids, 2, 0, 100).await.unwrap();
        let acquired: Vec<BlockId> = cache
            .events()
            .into_iter()
            .filter_map(|e| match e {
                CacheEvent::Acquired { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(acquired[0], ids[0]);
        assert_eq!(acquired.len(), 5);
    }

    #[tokio::test]
    async fn corrupt_block_fails_and_returns_buffers() {
        let cache = small_cache();
        let ids = build_tree(&cache, 2, 0, 128);
        let root = cache.read_raw(ids[0]).unwrap();
        let leaf = format::kid_id(&root, 2);
        let mut bad = cache.read_raw(leaf).unwrap();
        bad[..4].copy_from_slice(b"lari");
        cache.write_raw(leaf, &bad).unwrap();

        let err = acquire_range(&cache, &ids, 2, 0, 128).await.err().unwrap();
        assert!(matches!(err, LargeBufError::CorruptBlock { level: 1, .. }));

        // Nothing is still held: a writer can take every block.
        let txn = cache.begin();
        let (roots, _) = Acquirer::new(&txn, Access::Write, LoadMode::Skip)
            .run(&ids, 2, 0, 64)
            .await
            .unwrap();
        assert!(roots[0].is_some());
    }

    #[tokio::test]
    async fn missing_block_is_an_error() {
        let cache = small_cache();
        let ids = vec![BlockId::new(999).unwrap()];
        let err = acquire_range(&cache, &ids, 1, 0, 10).await.err().unwrap();
        assert!(matches!(err, LargeBufError::Cache(_)));
    }

    #[tokio::test]
    async fn skip_mode_does_not_check_leaf_magic() {
        let cache = small_cache();
        let ids = build_tree(&cache, 1, 0, 20);
        cache.write_raw(ids[0], &[0u8; 36]).unwrap();
        let txn = cache.begin();
        let (_, count) = Acquirer::new(&txn, Access::Write, LoadMode::Skip)
            .run(&ids, 1, 0, 20)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    // -----------------------------------------------------------------------
    // Completion accounting
    // -----------------------------------------------------------------------

    /// An acquirer that has already taken the single leaf of a one-level
    /// tree. Returns the leaf's token and id.
    fn acquired_leaf<'t>(
        txn: &'t MemoryTransaction,
        cache: &MemoryCache,
    ) -> (Acquirer<'t, MemoryTransaction>, usize, BlockId) {
        let ids = build_tree(cache, 1, 0, 20);
        let mut acquirer = Acquirer::new(txn, Access::Read, LoadMode::Contents);
        acquirer.hi = 20;
        acquirer.outstanding_roots = 1;
        let idx = acquirer.issue(None, 0, 1, 0, ids[0]);
        assert!(acquirer.nodes[idx].completed);
        assert_eq!(acquirer.outstanding_roots, 0);
        (acquirer, idx, ids[0])
    }

    #[test]
    #[should_panic(expected = "delivered twice")]
    fn second_delivery_for_a_token_panics() {
        let cache = small_cache();
        let txn = cache.begin();
        let (mut acquirer, idx, block) = acquired_leaf(&txn, &cache);
        acquirer.on_delivery(Delivery {
            token: idx,
            block,
            result: Err(CacheError::BlockNotFound(block)),
        });
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn completing_a_node_twice_panics() {
        let cache = small_cache();
        let txn = cache.begin();
        let (mut acquirer, idx, _) = acquired_leaf(&txn, &cache);
        acquirer.complete(idx);
    }

    #[test]
    #[should_panic(expected = "negative outstanding root count")]
    fn root_completing_without_being_counted_panics() {
        let cache = small_cache();
        let txn = cache.begin();
        let ids = build_tree(&cache, 1, 0, 20);
        let mut acquirer = Acquirer::new(&txn, Access::Read, LoadMode::Contents);
        acquirer.hi = 20;
        acquirer.issue(None, 0, 1, 0, ids[0]);
    }

    #[test]
    #[should_panic(expected = "negative outstanding count")]
    fn child_completing_past_its_parent_count_panics() {
        let cache = small_cache();
        let txn = cache.begin();
        let ids = build_tree(&cache, 2, 0, 20);
        let mut acquirer = Acquirer::new(&txn, Access::Read, LoadMode::Contents);
        acquirer.hi = 20;
        acquirer.outstanding_roots = 1;
        let root = acquirer.issue(None, 0, 2, 0, ids[0]);
        assert!(acquirer.nodes[root].completed);
        assert_eq!(acquirer.nodes[root].outstanding, 0);

        let leaf = acquirer.nodes[root].children[0];
        acquirer.nodes[leaf].completed = false;
        acquirer.complete(leaf);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn deferred_loads_complete_in_any_order() {
        let cache = crate::test_support::async_cache();
        let ids = build_tree(&cache, 3, 0, 400);
        for _ in 0..20 {
            cache.evict_all();
            let (roots, count) = acquire_range(&cache, &ids, 3, 0, 400).await.unwrap();
            // Root, 4 internal nodes, and 13 leaves.
            assert_eq!(count, 1 + 4 + 13);
            assert_eq!(roots[0].as_ref().unwrap().loaded_count(), 18);
        }
    }
}
