use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use lvs_types::{Access, BlockId, BlockSize, TypeError};
use rand::Rng;
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::traits::{Acquisition, BlockBuf, LoadMode, Transaction};
use crate::waiter::BlockWaiter;

/// Something that happened inside a [`MemoryCache`], recorded in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheEvent {
    Allocated(BlockId),
    Acquired { id: BlockId, access: Access },
    /// Contents were read for a block that was not resident.
    Loaded(BlockId),
    /// A dirty buffer was written back.
    Written(BlockId),
    Freed(BlockId),
}

struct StoredBlock {
    data: Box<[u8]>,
    resident: bool,
    readers: usize,
    writer: bool,
    queue: VecDeque<QueuedAcquire>,
}

struct QueuedAcquire {
    access: Access,
    load: LoadMode,
    waiter: BlockWaiter<MemoryBuf>,
}

#[derive(Default)]
struct CacheState {
    blocks: HashMap<BlockId, StoredBlock>,
    free_ids: Vec<BlockId>,
    next_id: u64,
    events: Vec<CacheEvent>,
}

struct CacheInner {
    config: CacheConfig,
    block_size: BlockSize,
    state: Mutex<CacheState>,
}

impl CacheInner {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().expect("cache lock poisoned")
    }

    fn zeroed(&self) -> Box<[u8]> {
        vec![0u8; self.block_size.bytes()].into_boxed_slice()
    }

    /// Take the lock on `block` for `access` and build the buffer handed to
    /// the caller. Returns whether the contents had to be loaded.
    fn grant(
        self: &Arc<Self>,
        block: &mut StoredBlock,
        events: &mut Vec<CacheEvent>,
        id: BlockId,
        access: Access,
        load: LoadMode,
    ) -> (MemoryBuf, bool) {
        match access {
            Access::Read => block.readers += 1,
            Access::Write => block.writer = true,
        }
        events.push(CacheEvent::Acquired { id, access });

        let from_disk = !block.resident && load == LoadMode::Contents;
        let data = if block.resident || load == LoadMode::Contents {
            if from_disk {
                block.resident = true;
                events.push(CacheEvent::Loaded(id));
            }
            block.data.clone()
        } else {
            self.zeroed()
        };

        let buf = MemoryBuf {
            id,
            access,
            data,
            dirty: false,
            deleted: false,
            cache: Arc::clone(self),
        };
        (buf, from_disk)
    }

    /// Return a buffer: write back or free, drop its lock, and grant whatever
    /// queued acquisitions are now compatible.
    fn release(self: &Arc<Self>, buf: &mut MemoryBuf) {
        let mut ready = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            if buf.deleted {
                if let Some(block) = state.blocks.remove(&buf.id) {
                    state.free_ids.push(buf.id);
                    state.events.push(CacheEvent::Freed(buf.id));
                    for queued in block.queue {
                        ready.push((queued.waiter, Err(CacheError::BlockNotFound(buf.id))));
                    }
                }
            } else if let Some(block) = state.blocks.get_mut(&buf.id) {
                if buf.dirty {
                    block.data = std::mem::take(&mut buf.data);
                    state.events.push(CacheEvent::Written(buf.id));
                }
                match buf.access {
                    Access::Read => block.readers -= 1,
                    Access::Write => block.writer = false,
                }
                while let Some(front) = block.queue.front() {
                    if !front.access.compatible_with(block.readers, block.writer) {
                        break;
                    }
                    let Some(queued) = block.queue.pop_front() else {
                        break;
                    };
                    let (granted, _) =
                        self.grant(block, &mut state.events, buf.id, queued.access, queued.load);
                    ready.push((queued.waiter, Ok(granted)));
                }
            }
        }
        // Deliver outside the lock: a waiter's receiver may drop the buffer
        // straight back into `release`.
        for (waiter, result) in ready {
            waiter.deliver(result);
        }
    }
}

/// In-memory block cache with per-block shared/exclusive locking.
///
/// Intended for tests and embedding. Block contents live in a `HashMap`
/// behind a `Mutex`; buffers are private copies that are written back when a
/// dirty buffer is dropped. Blocks can be marked non-resident with
/// [`evict_all`](Self::evict_all) so that later acquisitions go through the
/// asynchronous load path when [`CacheConfig::async_loads`] is set.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Arc<CacheInner>,
}

impl MemoryCache {
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        let block_size = config.block_size()?;
        Ok(Self {
            inner: Arc::new(CacheInner {
                config,
                block_size,
                state: Mutex::new(CacheState::default()),
            }),
        })
    }

    /// A synchronous cache with the given block size and default settings.
    pub fn with_block_size(block_size: u32) -> CacheResult<Self> {
        Self::new(CacheConfig {
            block_size,
            ..CacheConfig::default()
        })
    }

    /// Start a transaction against this cache.
    pub fn begin(&self) -> MemoryTransaction {
        MemoryTransaction {
            cache: Arc::clone(&self.inner),
        }
    }

    pub fn block_size(&self) -> BlockSize {
        self.inner.block_size
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Number of live (allocated, not freed) blocks.
    pub fn len(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().blocks.is_empty()
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.inner.lock().blocks.contains_key(&id)
    }

    /// Sorted ids of every live block.
    pub fn live_blocks(&self) -> Vec<BlockId> {
        let state = self.inner.lock();
        let mut ids: Vec<BlockId> = state.blocks.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Every event recorded so far.
    pub fn events(&self) -> Vec<CacheEvent> {
        self.inner.lock().events.clone()
    }

    /// Drain the event log.
    pub fn take_events(&self) -> Vec<CacheEvent> {
        std::mem::take(&mut self.inner.lock().events)
    }

    /// Mark every block that nobody holds as non-resident. Returns how many
    /// blocks were evicted.
    pub fn evict_all(&self) -> usize {
        let mut state = self.inner.lock();
        let mut evicted = 0;
        for block in state.blocks.values_mut() {
            if block.resident && block.readers == 0 && !block.writer {
                block.resident = false;
                evicted += 1;
            }
        }
        debug!(evicted, "evicted idle blocks");
        evicted
    }

    /// Stored contents of a block, bypassing locking.
    pub fn read_raw(&self, id: BlockId) -> Option<Vec<u8>> {
        self.inner.lock().blocks.get(&id).map(|b| b.data.to_vec())
    }

    /// Overwrite the stored contents of a block, bypassing locking. Used to
    /// inject corruption.
    pub fn write_raw(&self, id: BlockId, data: &[u8]) -> CacheResult<()> {
        let expected = self.inner.block_size.bytes();
        if data.len() != expected {
            return Err(TypeError::InvalidLength {
                expected,
                actual: data.len(),
            }
            .into());
        }
        let mut state = self.inner.lock();
        let block = state
            .blocks
            .get_mut(&id)
            .ok_or(CacheError::BlockNotFound(id))?;
        block.data.copy_from_slice(data);
        Ok(())
    }
}

impl fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.len();
        f.debug_struct("MemoryCache")
            .field("block_size", &self.inner.block_size.value())
            .field("block_count", &count)
            .finish()
    }
}

/// Transaction handle over a [`MemoryCache`].
#[derive(Clone)]
pub struct MemoryTransaction {
    cache: Arc<CacheInner>,
}

impl fmt::Debug for MemoryTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransaction")
            .field("block_size", &self.cache.block_size.value())
            .finish()
    }
}

impl Transaction for MemoryTransaction {
    type Buf = MemoryBuf;

    fn block_size(&self) -> BlockSize {
        self.cache.block_size
    }

    fn acquire(
        &self,
        id: BlockId,
        access: Access,
        load: LoadMode,
        waiter: BlockWaiter<MemoryBuf>,
    ) -> Acquisition<MemoryBuf> {
        let mut guard = self.cache.lock();
        let state = &mut *guard;
        let Some(block) = state.blocks.get_mut(&id) else {
            return Acquisition::Ready(Err(CacheError::BlockNotFound(id)));
        };

        if !block.queue.is_empty() || !access.compatible_with(block.readers, block.writer) {
            debug!(block = %id, %access, queued = block.queue.len() + 1, "acquisition waiting for lock");
            block.queue.push_back(QueuedAcquire {
                access,
                load,
                waiter,
            });
            return Acquisition::Pending;
        }

        let (buf, from_disk) = self
            .cache
            .grant(block, &mut state.events, id, access, load);
        drop(guard);

        if from_disk && self.cache.config.async_loads {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let yields = rand::thread_rng().gen_range(0..=self.cache.config.max_load_yields);
                runtime.spawn(async move {
                    for _ in 0..yields {
                        tokio::task::yield_now().await;
                    }
                    waiter.deliver(Ok(buf));
                });
                return Acquisition::Pending;
            }
        }
        Acquisition::Ready(Ok(buf))
    }

    fn allocate(&self) -> CacheResult<MemoryBuf> {
        let mut guard = self.cache.lock();
        let state = &mut *guard;
        if let Some(limit) = self.cache.config.max_blocks {
            if state.blocks.len() >= limit {
                return Err(CacheError::Full { limit });
            }
        }
        let id = match state.free_ids.pop() {
            Some(id) => id,
            None => {
                let id = BlockId::new(state.next_id).map_err(|_| CacheError::OutOfBlockIds)?;
                state.next_id += 1;
                id
            }
        };
        state.blocks.insert(
            id,
            StoredBlock {
                data: self.cache.zeroed(),
                resident: true,
                readers: 0,
                writer: true,
                queue: VecDeque::new(),
            },
        );
        state.events.push(CacheEvent::Allocated(id));
        Ok(MemoryBuf {
            id,
            access: Access::Write,
            data: self.cache.zeroed(),
            dirty: true,
            deleted: false,
            cache: Arc::clone(&self.cache),
        })
    }
}

/// A block held from a [`MemoryCache`]. Returned to the cache on drop.
pub struct MemoryBuf {
    id: BlockId,
    access: Access,
    data: Box<[u8]>,
    dirty: bool,
    deleted: bool,
    cache: Arc<CacheInner>,
}

impl MemoryBuf {
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl BlockBuf for MemoryBuf {
    fn block_id(&self) -> BlockId {
        self.id
    }

    fn access(&self) -> Access {
        self.access
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn data_mut(&mut self) -> &mut [u8] {
        assert!(self.access.is_write(), "write to block {} held for read", self.id);
        self.dirty = true;
        &mut self.data
    }

    fn mark_deleted(&mut self) {
        assert!(self.access.is_write(), "delete of block {} held for read", self.id);
        self.deleted = true;
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }
}

impl Drop for MemoryBuf {
    fn drop(&mut self) {
        let cache = Arc::clone(&self.cache);
        cache.release(self);
    }
}

impl fmt::Debug for MemoryBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBuf")
            .field("id", &self.id)
            .field("access", &self.access)
            .field("dirty", &self.dirty)
            .field("deleted", &self.deleted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waiter::delivery_channel;

    fn small_cache() -> MemoryCache {
        MemoryCache::with_block_size(36).unwrap()
    }

    fn ready(acq: Acquisition<MemoryBuf>) -> MemoryBuf {
        match acq {
            Acquisition::Ready(result) => result.unwrap(),
            Acquisition::Pending => panic!("expected an immediate acquisition"),
        }
    }

    fn new_block(txn: &MemoryTransaction, first_byte: u8) -> BlockId {
        let mut buf = txn.allocate().unwrap();
        buf.data_mut()[0] = first_byte;
        buf.block_id()
    }

    // -----------------------------------------------------------------------
    // Allocation and write-back
    // -----------------------------------------------------------------------

    #[test]
    fn allocate_hands_out_sequential_ids() {
        let cache = small_cache();
        let txn = cache.begin();
        let a = new_block(&txn, 1);
        let b = new_block(&txn, 2);
        assert_eq!(a.value(), 0);
        assert_eq!(b.value(), 1);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.live_blocks(), vec![a, b]);
    }

    #[test]
    fn allocation_stops_at_max_blocks() {
        let cache = MemoryCache::new(CacheConfig {
            block_size: 36,
            max_blocks: Some(2),
            ..CacheConfig::default()
        })
        .unwrap();
        let txn = cache.begin();
        let a = new_block(&txn, 1);
        new_block(&txn, 2);
        let err = txn.allocate().err().unwrap();
        assert!(matches!(err, CacheError::Full { limit: 2 }));
        assert_eq!(cache.len(), 2);

        let (tx, _rx) = delivery_channel();
        let mut buf = ready(txn.acquire(a, Access::Write, LoadMode::Contents, BlockWaiter::new(0, a, tx)));
        buf.mark_deleted();
        drop(buf);
        assert!(txn.allocate().is_ok());
    }

    #[test]
    fn dirty_buffer_is_written_back_on_drop() {
        let cache = small_cache();
        let txn = cache.begin();
        let id = new_block(&txn, 42);
        assert_eq!(cache.read_raw(id).unwrap()[0], 42);
        assert_eq!(
            cache.events(),
            vec![CacheEvent::Allocated(id), CacheEvent::Written(id)]
        );
    }

    #[test]
    fn clean_read_is_not_written_back() {
        let cache = small_cache();
        let txn = cache.begin();
        let id = new_block(&txn, 1);
        cache.take_events();

        let (tx, _rx) = delivery_channel();
        let buf = ready(txn.acquire(id, Access::Read, LoadMode::Contents, BlockWaiter::new(0, id, tx)));
        assert_eq!(buf.data()[0], 1);
        assert!(!buf.is_dirty());
        drop(buf);
        assert_eq!(
            cache.take_events(),
            vec![CacheEvent::Acquired {
                id,
                access: Access::Read
            }]
        );
    }

    #[test]
    fn missing_block_is_reported() {
        let cache = small_cache();
        let txn = cache.begin();
        let (tx, _rx) = delivery_channel();
        let id = BlockId::new(77).unwrap();
        match txn.acquire(id, Access::Read, LoadMode::Contents, BlockWaiter::new(0, id, tx)) {
            Acquisition::Ready(Err(CacheError::BlockNotFound(missing))) => assert_eq!(missing, id),
            _ => panic!("expected BlockNotFound"),
        }
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    #[test]
    fn deleted_block_is_freed_and_id_reused() {
        let cache = small_cache();
        let txn = cache.begin();
        let id = new_block(&txn, 1);

        let (tx, _rx) = delivery_channel();
        let mut buf = ready(txn.acquire(id, Access::Write, LoadMode::Skip, BlockWaiter::new(0, id, tx)));
        buf.mark_deleted();
        assert!(buf.is_deleted());
        drop(buf);

        assert!(cache.is_empty());
        assert!(cache.events().contains(&CacheEvent::Freed(id)));
        assert_eq!(txn.allocate().unwrap().block_id(), id);
    }

    #[test]
    #[should_panic(expected = "held for read")]
    fn read_buffer_cannot_be_written() {
        let cache = small_cache();
        let txn = cache.begin();
        let id = new_block(&txn, 1);
        let (tx, _rx) = delivery_channel();
        let mut buf = ready(txn.acquire(id, Access::Read, LoadMode::Contents, BlockWaiter::new(0, id, tx)));
        buf.data_mut()[0] = 9;
    }

    // -----------------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------------

    #[test]
    fn readers_share_a_block() {
        let cache = small_cache();
        let txn = cache.begin();
        let id = new_block(&txn, 5);
        let (tx, _rx) = delivery_channel();
        let a = ready(txn.acquire(id, Access::Read, LoadMode::Contents, BlockWaiter::new(0, id, tx.clone())));
        let b = ready(txn.acquire(id, Access::Read, LoadMode::Contents, BlockWaiter::new(1, id, tx)));
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn writer_waits_for_reader_release() {
        let cache = small_cache();
        let txn = cache.begin();
        let id = new_block(&txn, 5);
        let (tx, mut rx) = delivery_channel();

        let reader = ready(txn.acquire(id, Access::Read, LoadMode::Contents, BlockWaiter::new(0, id, tx.clone())));
        let pending = txn.acquire(id, Access::Write, LoadMode::Contents, BlockWaiter::new(1, id, tx.clone()));
        assert!(matches!(pending, Acquisition::Pending));
        assert!(rx.try_recv().is_err());

        drop(reader);
        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.token, 1);
        let writer = delivery.result.unwrap();
        assert_eq!(writer.access(), Access::Write);

        // A later reader queues behind the writer.
        let pending = txn.acquire(id, Access::Read, LoadMode::Contents, BlockWaiter::new(2, id, tx));
        assert!(matches!(pending, Acquisition::Pending));
        drop(writer);
        assert_eq!(rx.try_recv().unwrap().token, 2);
    }

    #[test]
    fn queued_acquirers_of_a_deleted_block_get_not_found() {
        let cache = small_cache();
        let txn = cache.begin();
        let id = new_block(&txn, 5);
        let (tx, mut rx) = delivery_channel();

        let mut writer = ready(txn.acquire(id, Access::Write, LoadMode::Contents, BlockWaiter::new(0, id, tx.clone())));
        let pending = txn.acquire(id, Access::Read, LoadMode::Contents, BlockWaiter::new(1, id, tx));
        assert!(matches!(pending, Acquisition::Pending));
        writer.mark_deleted();
        drop(writer);

        let delivery = rx.try_recv().unwrap();
        assert!(matches!(delivery.result, Err(CacheError::BlockNotFound(_))));
    }

    // -----------------------------------------------------------------------
    // Residency and asynchronous loads
    // -----------------------------------------------------------------------

    #[test]
    fn evicted_block_loads_inline_without_async() {
        let cache = small_cache();
        let txn = cache.begin();
        let id = new_block(&txn, 3);
        assert_eq!(cache.evict_all(), 1);
        cache.take_events();

        let (tx, _rx) = delivery_channel();
        let buf = ready(txn.acquire(id, Access::Read, LoadMode::Contents, BlockWaiter::new(0, id, tx)));
        assert_eq!(buf.data()[0], 3);
        assert!(cache.events().contains(&CacheEvent::Loaded(id)));
    }

    #[test]
    fn skip_mode_does_not_load() {
        let cache = small_cache();
        let txn = cache.begin();
        let id = new_block(&txn, 3);
        cache.evict_all();
        cache.take_events();

        let (tx, _rx) = delivery_channel();
        let buf = ready(txn.acquire(id, Access::Write, LoadMode::Skip, BlockWaiter::new(0, id, tx)));
        assert_eq!(buf.data()[0], 0);
        assert!(!cache.events().contains(&CacheEvent::Loaded(id)));
    }

    #[tokio::test]
    async fn evicted_block_loads_asynchronously() {
        let config = CacheConfig {
            block_size: 36,
            ..CacheConfig::default()
        }
        .with_async_loads();
        let cache = MemoryCache::new(config).unwrap();
        let txn = cache.begin();
        let id = new_block(&txn, 7);
        cache.evict_all();

        let (tx, mut rx) = delivery_channel();
        let acq = txn.acquire(id, Access::Read, LoadMode::Contents, BlockWaiter::new(9, id, tx));
        assert!(matches!(acq, Acquisition::Pending));

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.token, 9);
        assert_eq!(delivery.result.unwrap().data()[0], 7);
        assert!(cache.events().contains(&CacheEvent::Loaded(id)));
    }

    // -----------------------------------------------------------------------
    // Raw access
    // -----------------------------------------------------------------------

    #[test]
    fn write_raw_checks_length() {
        let cache = small_cache();
        let txn = cache.begin();
        let id = new_block(&txn, 0);
        assert!(cache.write_raw(id, &[1, 2, 3]).is_err());
        cache.write_raw(id, &[9u8; 36]).unwrap();
        assert_eq!(cache.read_raw(id).unwrap(), vec![9u8; 36]);
    }

    #[test]
    fn debug_format() {
        let cache = small_cache();
        let debug = format!("{cache:?}");
        assert!(debug.contains("MemoryCache"));
        assert!(debug.contains("block_count"));
    }
}
