//! Byte-level access to an acquired large buffer.
//!
//! A segment is the part of the value held by one leaf. Segment 0 starts at
//! logical position 0 and may begin partway into its leaf; every later
//! segment starts on a leaf boundary. Only the last segment can end early.

use std::ops::Range;

use lvs_cache::Transaction;

use crate::large_buf::{LargeBuf, State};
use crate::node::{leaf_at, leaf_at_mut};
use crate::shape::{ceil_div, leaf_bytes};

impl<'a, T: Transaction> LargeBuf<'a, T> {
    fn leaf_len(&self) -> i64 {
        leaf_bytes(self.block_size())
    }

    pub fn num_segments(&self) -> usize {
        let reference = self.root_ref();
        let leaf_len = self.leaf_len();
        let first = reference.offset / leaf_len;
        (ceil_div(reference.end_offset(), leaf_len) - first) as usize
    }

    /// Logical positions covered by segment `ix`.
    pub fn segment_bounds(&self, ix: usize) -> Range<i64> {
        let reference = self.root_ref();
        let leaf_len = self.leaf_len();
        assert!(
            ix < self.num_segments(),
            "segment {ix} of {}",
            self.num_segments()
        );
        let leaf_start = (reference.offset / leaf_len + ix as i64) * leaf_len;
        let start = leaf_start.max(reference.offset) - reference.offset;
        let end = (leaf_start + leaf_len).min(reference.end_offset()) - reference.offset;
        start..end
    }

    pub fn segment_size(&self, ix: usize) -> usize {
        let bounds = self.segment_bounds(ix);
        (bounds.end - bounds.start) as usize
    }

    /// Index of the segment holding logical position `pos`.
    pub fn pos_to_ix(&self, pos: i64) -> usize {
        let reference = self.root_ref();
        assert!(
            pos >= 0 && pos < reference.size,
            "position {pos} outside a {}-byte value",
            reference.size
        );
        let leaf_len = self.leaf_len();
        ((reference.offset + pos) / leaf_len - reference.offset / leaf_len) as usize
    }

    /// Offset of logical position `pos` within its segment.
    pub fn pos_to_seg_pos(&self, pos: i64) -> usize {
        let ix = self.pos_to_ix(pos);
        (pos - self.segment_bounds(ix).start) as usize
    }

    /// Bytes of segment `ix`. The leaf must have been acquired.
    pub fn segment(&self, ix: usize) -> &[u8] {
        self.expect_readable("segment");
        let bounds = self.segment_bounds(ix);
        let abs = self.root_ref().offset + bounds.start;
        let within = (abs % self.leaf_len()) as usize;
        let len = (bounds.end - bounds.start) as usize;
        let leaf = leaf_at(self.roots(), self.block_size(), self.levels(), abs);
        &leaf.leaf_payload()[within..within + len]
    }

    /// Writable bytes of segment `ix`; the leaf is written back on release.
    pub fn segment_mut(&mut self, ix: usize) -> &mut [u8] {
        self.expect_writable("segment_mut");
        let bounds = self.segment_bounds(ix);
        let abs = self.root_ref().offset + bounds.start;
        let within = (abs % self.leaf_len()) as usize;
        let len = (bounds.end - bounds.start) as usize;
        let (block_size, levels) = (self.block_size(), self.levels());
        let leaf = leaf_at_mut(self.roots_mut(), block_size, levels, abs);
        &mut leaf.leaf_payload_mut()[within..within + len]
    }

    /// Every segment in order. All leaves must have been acquired.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.num_segments()).map(move |ix| self.segment(ix))
    }

    /// Copy `out.len()` bytes starting at logical position `pos`.
    pub fn read_at(&self, pos: i64, out: &mut [u8]) {
        let size = self.root_ref().size;
        assert!(
            pos >= 0 && pos + out.len() as i64 <= size,
            "read of {} bytes at {pos} is outside a {size}-byte value",
            out.len()
        );
        let mut pos = pos;
        let mut rest = out;
        while !rest.is_empty() {
            let ix = self.pos_to_ix(pos);
            let seg = &self.segment(ix)[self.pos_to_seg_pos(pos)..];
            let n = seg.len().min(rest.len());
            let (head, tail) = rest.split_at_mut(n);
            head.copy_from_slice(&seg[..n]);
            rest = tail;
            pos += n as i64;
        }
    }

    /// The whole value as one vector.
    pub fn read_all(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.root_ref().size as usize);
        for seg in self.segments() {
            out.extend_from_slice(seg);
        }
        out
    }

    fn expect_readable(&self, op: &str) {
        assert_eq!(
            self.state(),
            State::Loaded,
            "{op} on a {:?} large buffer",
            self.state()
        );
    }
}
