use std::collections::BTreeSet;

use lvs_cache::{BlockBuf, CacheConfig, MemoryCache, MemoryTransaction, Transaction};
use lvs_types::{BlockId, BlockSize};

use crate::format;
use crate::reference::LargeBufRef;
use crate::shape::{child_slots, internal_kids, max_offset, num_sublevels, InlineLimit};

/// 36-byte blocks: 32 payload bytes per leaf, fan-out 4.
pub(crate) fn small_cache() -> MemoryCache {
    MemoryCache::with_block_size(36).unwrap()
}

/// Like [`small_cache`], with non-resident blocks delivered from tokio tasks.
pub(crate) fn async_cache() -> MemoryCache {
    let config = CacheConfig {
        block_size: 36,
        ..CacheConfig::default()
    };
    MemoryCache::new(config.with_async_loads()).unwrap()
}

pub(crate) fn limit(cache: &MemoryCache, m: usize) -> InlineLimit {
    InlineLimit::new(m, cache.block_size()).unwrap()
}

pub(crate) fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Write a well-formed tree covering `[lo, hi)` straight through the cache
/// and return its root ids. Roots before the range are null.
pub(crate) fn build_tree(cache: &MemoryCache, levels: u32, lo: i64, hi: i64) -> Vec<BlockId> {
    let txn = cache.begin();
    let block_size = cache.block_size();
    let span = max_offset(block_size, levels);
    let first = lo / span;
    let last = (hi - 1) / span;
    (0..=last)
        .map(|k| {
            if k < first {
                BlockId::NULL
            } else {
                build_node(&txn, block_size, levels, k * span, lo, hi)
            }
        })
        .collect()
}

fn build_node(
    txn: &MemoryTransaction,
    block_size: BlockSize,
    level: u32,
    base: i64,
    lo: i64,
    hi: i64,
) -> BlockId {
    let mut buf = txn.allocate().unwrap();
    format::init_block(buf.data_mut(), level);
    if level > 1 {
        let child_span = max_offset(block_size, level - 1);
        for slot in child_slots(block_size, level, base, lo, hi) {
            let kid = build_node(txn, block_size, level - 1, base + slot as i64 * child_span, lo, hi);
            format::set_kid_id(buf.data_mut(), slot, kid);
        }
    }
    buf.block_id()
}

/// Every block reachable from `reference`, read from the cache's stored
/// contents.
pub(crate) fn referenced_blocks(
    cache: &MemoryCache,
    reference: &LargeBufRef,
    limit: InlineLimit,
) -> BTreeSet<BlockId> {
    let block_size = cache.block_size();
    let levels = num_sublevels(block_size, reference.end_offset(), limit);
    let kids = internal_kids(block_size) as usize;
    let mut stack: Vec<(BlockId, u32)> = reference
        .ids
        .iter()
        .filter(|id| !id.is_null())
        .map(|id| (*id, levels))
        .collect();
    let mut found = BTreeSet::new();
    while let Some((id, level)) = stack.pop() {
        found.insert(id);
        if level > 1 {
            let data = cache.read_raw(id).unwrap();
            for slot in 0..kids {
                let kid = format::kid_id(&data, slot);
                if !kid.is_null() {
                    stack.push((kid, level - 1));
                }
            }
        }
    }
    found
}
