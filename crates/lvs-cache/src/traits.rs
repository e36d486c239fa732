use lvs_types::{Access, BlockId, BlockSize};

use crate::error::CacheResult;
use crate::waiter::BlockWaiter;

/// An acquired block buffer.
///
/// A buffer is held under the [`Access`] mode it was acquired with and goes
/// back to the cache when dropped: dirty contents are written back and
/// deleted blocks are freed at that point.
pub trait BlockBuf: Send {
    fn block_id(&self) -> BlockId;

    fn access(&self) -> Access;

    /// The block contents, exactly [`BlockSize::bytes`] long.
    fn data(&self) -> &[u8];

    /// Mutable contents. Calling this marks the block dirty, so it must only
    /// be used on buffers held with [`Access::Write`].
    fn data_mut(&mut self) -> &mut [u8];

    /// Free the block's storage once this buffer is returned.
    fn mark_deleted(&mut self);

    fn is_deleted(&self) -> bool;
}

/// Whether an acquisition needs the block's stored contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadMode {
    /// Read the stored bytes (from disk if not resident).
    Contents,
    /// Only take the lock; contents are unspecified. Used when the caller is
    /// about to delete or fully overwrite the block.
    Skip,
}

/// Outcome of issuing an acquisition.
#[derive(Debug)]
pub enum Acquisition<B> {
    /// The block was available right away; the waiter was not used.
    Ready(CacheResult<B>),
    /// The cache kept the waiter and will deliver through it exactly once,
    /// possibly from another thread.
    Pending,
}

/// Transactional access to a block cache.
///
/// All implementations must satisfy these invariants:
/// - A `Pending` acquisition is eventually delivered through its waiter,
///   exactly once. There is no cancellation.
/// - Per-block locking honours [`Access`]: shared readers, exclusive writers.
///   Conflicting requests wait rather than fail.
/// - Freshly allocated blocks are returned write-locked and dirty.
pub trait Transaction: Send + Sync {
    type Buf: BlockBuf;

    /// Capacity of every block served by this transaction.
    fn block_size(&self) -> BlockSize;

    /// Acquire `id` in `access` mode.
    ///
    /// Returns [`Acquisition::Ready`] when the block can be handed out
    /// immediately; otherwise the waiter is retained and fired later.
    fn acquire(
        &self,
        id: BlockId,
        access: Access,
        load: LoadMode,
        waiter: BlockWaiter<Self::Buf>,
    ) -> Acquisition<Self::Buf>;

    /// Allocate a fresh, zero-filled block.
    fn allocate(&self) -> CacheResult<Self::Buf>;
}
