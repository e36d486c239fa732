use lvs_cache::{LoadMode, Transaction};
use lvs_types::{Access, BlockSize};
use tracing::{debug, warn};

use crate::acquire::Acquirer;
use crate::error::{LargeBufError, LargeBufResult};
use crate::mutate::TreeEditor;
use crate::node::Roots;
use crate::reference::LargeBufRef;
use crate::shape::{num_inlined, num_sublevels, InlineLimit};

/// Lifecycle of a [`LargeBuf`]. Only moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    NotLoaded,
    /// An acquisition was issued and has not completed. A failed
    /// acquisition leaves the buffer here for good.
    Loading,
    Loaded,
    Deleted,
    Released,
    /// An allocation or resize ran out of blocks partway through. The tree
    /// and reference are left half-built; drop the buffer.
    Failed,
}

/// Controller for one large value during one operation.
///
/// Borrows the caller's transaction and the [`LargeBufRef`] embedded in the
/// caller's record; the record persists the reference bytes. Blocks are
/// acquired with one of the `acquire*` methods (or created with
/// [`allocate`](Self::allocate)), edited or read, and handed back with
/// [`release`](Self::release).
///
/// Calling an operation in the wrong [`State`], or touching a block that
/// was not acquired, panics.
pub struct LargeBuf<'a, T: Transaction> {
    txn: &'a T,
    block_size: BlockSize,
    root_ref: Option<&'a mut LargeBufRef>,
    limit: Option<InlineLimit>,
    roots: Roots<T::Buf>,
    access: Access,
    state: State,
    num_bufs: i64,
}

impl<'a, T: Transaction> LargeBuf<'a, T> {
    pub fn new(txn: &'a T) -> Self {
        Self {
            txn,
            block_size: txn.block_size(),
            root_ref: None,
            limit: None,
            roots: Vec::new(),
            access: Access::Read,
            state: State::NotLoaded,
            num_bufs: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn access(&self) -> Access {
        self.access
    }

    /// Number of block buffers currently held.
    pub fn num_bufs(&self) -> i64 {
        self.num_bufs
    }

    pub fn transaction(&self) -> &'a T {
        self.txn
    }

    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    pub fn inline_limit(&self) -> InlineLimit {
        match self.limit {
            Some(limit) => limit,
            None => panic!("large buffer has no reference yet"),
        }
    }

    /// The reference this controller edits.
    pub fn root_ref(&self) -> &LargeBufRef {
        let Some(reference) = self.root_ref.as_deref() else {
            panic!("large buffer has no reference yet");
        };
        debug_assert!(self
            .roots
            .first()
            .and_then(|root| root.as_deref())
            .map_or(true, |root| root.level() == self.levels()));
        reference
    }

    /// Depth of the subtrees under the inline ids.
    pub fn levels(&self) -> u32 {
        let Some(reference) = self.root_ref.as_deref() else {
            return 0;
        };
        num_sublevels(self.block_size, reference.end_offset(), self.inline_limit())
    }

    /// Point the controller at another copy of its reference, for callers
    /// that moved the owning record. Both copies must name the same blocks.
    pub fn rebind_root_ref(&mut self, alternate: &'a mut LargeBufRef) {
        let current = self.root_ref();
        assert_eq!(
            alternate.ids, current.ids,
            "rebinding to a reference with different block ids"
        );
        self.root_ref = Some(alternate);
    }

    /// Build a fresh tree for `size` bytes and record it in `root_ref`,
    /// which must be empty. The buffer ends up loaded for writing; its bytes
    /// are unspecified until filled.
    pub fn allocate(
        &mut self,
        size: i64,
        root_ref: &'a mut LargeBufRef,
        limit: InlineLimit,
    ) -> LargeBufResult<()> {
        self.expect_state(State::NotLoaded, "allocate");
        assert!(size > 0, "allocation of {size} bytes");
        assert!(root_ref.is_empty(), "allocation into a non-empty reference");
        self.check_limit(limit);

        self.root_ref = Some(root_ref);
        self.limit = Some(limit);
        self.access = Access::Write;
        let result = self.editor().allocate(size);
        self.settle(result, "allocate")?;
        self.state = State::Loaded;
        Ok(())
    }

    /// Acquire every block of the value.
    pub async fn acquire(
        &mut self,
        root_ref: &'a mut LargeBufRef,
        limit: InlineLimit,
        access: Access,
    ) -> LargeBufResult<()> {
        let size = root_ref.size;
        self.acquire_range(root_ref, limit, access, LoadMode::Contents, 0, size)
            .await
    }

    /// Acquire only the path to the first byte, for prepending and
    /// unprepending within the first leaf.
    pub async fn acquire_lhs(
        &mut self,
        root_ref: &'a mut LargeBufRef,
        limit: InlineLimit,
        access: Access,
    ) -> LargeBufResult<()> {
        self.acquire_range(root_ref, limit, access, LoadMode::Contents, 0, 1)
            .await
    }

    /// Acquire only the path to the last byte, for appending and
    /// unappending within the last leaf.
    pub async fn acquire_rhs(
        &mut self,
        root_ref: &'a mut LargeBufRef,
        limit: InlineLimit,
        access: Access,
    ) -> LargeBufResult<()> {
        let last = root_ref.size - 1;
        self.acquire_range(root_ref, limit, access, LoadMode::Contents, last, 1)
            .await
    }

    /// Write-acquire every block without reading leaf contents, ahead of
    /// [`mark_deleted`](Self::mark_deleted).
    pub async fn acquire_for_delete(
        &mut self,
        root_ref: &'a mut LargeBufRef,
        limit: InlineLimit,
    ) -> LargeBufResult<()> {
        let size = root_ref.size;
        self.acquire_range(root_ref, limit, Access::Write, LoadMode::Skip, 0, size)
            .await
    }

    /// Acquire the blocks holding logical bytes `[offset, offset + size)`.
    pub async fn acquire_slice(
        &mut self,
        root_ref: &'a mut LargeBufRef,
        limit: InlineLimit,
        access: Access,
        offset: i64,
        size: i64,
    ) -> LargeBufResult<()> {
        self.acquire_range(root_ref, limit, access, LoadMode::Contents, offset, size)
            .await
    }

    async fn acquire_range(
        &mut self,
        root_ref: &'a mut LargeBufRef,
        limit: InlineLimit,
        access: Access,
        leaf_load: LoadMode,
        offset: i64,
        size: i64,
    ) -> LargeBufResult<()> {
        self.expect_state(State::NotLoaded, "acquire");
        self.check_limit(limit);
        assert!(
            size > 0 && offset >= 0 && offset + size <= root_ref.size,
            "slice of {size} bytes at {offset} is outside a {}-byte value",
            root_ref.size
        );
        self.state = State::Loading;

        let end = root_ref.end_offset();
        let expected = num_inlined(self.block_size, end, limit);
        if root_ref.ids.len() != expected {
            return Err(LargeBufError::MalformedRef(format!(
                "{} inline ids where {expected} are expected",
                root_ref.ids.len()
            )));
        }
        let levels = num_sublevels(self.block_size, end, limit);
        let ids = root_ref.ids.clone();
        let lo = root_ref.offset + offset;

        self.root_ref = Some(root_ref);
        self.limit = Some(limit);
        self.access = access;

        let acquirer = Acquirer::new(self.txn, access, leaf_load);
        let (roots, count) = acquirer.run(&ids, levels, lo, lo + size).await?;
        self.roots = roots;
        self.num_bufs += count;
        self.state = State::Loaded;
        Ok(())
    }

    /// Grow the value by `extra` bytes at the end. Returns the change in
    /// the reference's serialized size, which the owning record must apply.
    pub fn append(&mut self, extra: i64) -> LargeBufResult<isize> {
        self.expect_writable("append");
        assert!(extra >= 0, "append of {extra} bytes");
        if extra == 0 {
            return Ok(0);
        }
        let result = self.editor().append(extra);
        self.settle(result, "append")
    }

    /// Grow the value by `extra` bytes at the front.
    pub fn prepend(&mut self, extra: i64) -> LargeBufResult<isize> {
        self.expect_writable("prepend");
        assert!(extra >= 0, "prepend of {extra} bytes");
        if extra == 0 {
            return Ok(0);
        }
        let result = self.editor().prepend(extra);
        self.settle(result, "prepend")
    }

    /// Drop `extra` bytes from the end, freeing blocks that no longer hold
    /// any of the value. At least one byte must remain.
    pub fn unappend(&mut self, extra: i64) -> isize {
        self.expect_writable("unappend");
        self.check_shrink(extra);
        if extra == 0 {
            return 0;
        }
        self.editor().unappend(extra)
    }

    /// Drop `extra` bytes from the front.
    pub fn unprepend(&mut self, extra: i64) -> isize {
        self.expect_writable("unprepend");
        self.check_shrink(extra);
        if extra == 0 {
            return 0;
        }
        self.editor().unprepend(extra)
    }

    /// Copy `data` into the value at logical position `pos`.
    pub fn fill_at(&mut self, pos: i64, data: &[u8]) {
        self.expect_writable("fill");
        let size = self.root_ref().size;
        assert!(
            pos >= 0 && pos + data.len() as i64 <= size,
            "fill of {} bytes at {pos} is outside a {size}-byte value",
            data.len()
        );
        self.editor().fill_at(pos, data);
    }

    /// Mark every block of the tree deleted. The blocks are freed when the
    /// buffer is released.
    pub fn mark_deleted(&mut self) {
        self.expect_writable("mark_deleted");
        let Some(reference) = self.root_ref.as_deref() else {
            panic!("large buffer has no reference yet");
        };
        for (id, root) in reference.ids.iter().zip(self.roots.iter_mut()) {
            if id.is_null() {
                continue;
            }
            match root {
                Some(root) => root.mark_deleted(),
                None => panic!("cannot delete block {id}: it was not acquired"),
            }
        }
        self.state = State::Deleted;
        debug!(blocks = self.num_bufs, "marked large buffer deleted");
    }

    /// Return every held block to the cache.
    pub fn release(&mut self) {
        assert!(
            matches!(self.state, State::Loaded | State::Deleted),
            "release of a {:?} large buffer",
            self.state
        );
        for root in self.roots.drain(..).flatten() {
            self.num_bufs -= root.teardown();
        }
        assert_eq!(self.num_bufs, 0, "large buffer lost track of its blocks");
        self.state = State::Released;
        debug!("released large buffer");
    }

    pub(crate) fn roots(&self) -> &Roots<T::Buf> {
        &self.roots
    }

    pub(crate) fn roots_mut(&mut self) -> &mut Roots<T::Buf> {
        &mut self.roots
    }

    pub(crate) fn expect_state(&self, state: State, op: &str) {
        assert_eq!(self.state, state, "{op} on a {:?} large buffer", self.state);
    }

    pub(crate) fn expect_writable(&self, op: &str) {
        self.expect_state(State::Loaded, op);
        assert!(self.access.is_write(), "{op} on a read-only large buffer");
    }

    /// Move to [`State::Failed`] if a structural change returned an error.
    fn settle<R>(&mut self, result: LargeBufResult<R>, op: &str) -> LargeBufResult<R> {
        if let Err(err) = &result {
            warn!(error = %err, op, "large buffer left half-built");
            self.state = State::Failed;
        }
        result
    }

    fn check_limit(&self, limit: InlineLimit) {
        assert!(
            limit.fits(self.block_size),
            "inline limit {limit} is too large for {} blocks",
            self.block_size
        );
    }

    fn check_shrink(&self, extra: i64) {
        let size = self.root_ref().size;
        assert!(
            extra >= 0 && extra < size,
            "cannot remove {extra} of {size} bytes"
        );
    }

    fn editor(&mut self) -> TreeEditor<'_, T> {
        let limit = self.inline_limit();
        let Some(reference) = self.root_ref.as_deref_mut() else {
            panic!("large buffer has no reference yet");
        };
        TreeEditor::new(self.txn, limit, reference, &mut self.roots, &mut self.num_bufs)
    }
}
