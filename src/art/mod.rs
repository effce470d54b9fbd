//! Adaptive radix tree index over the value log.
//!
//! Based on "The Adaptive Radix Tree: ARTful Indexing for Main-Memory
//! Databases" (Leis et al., 2013), with path compression and lazy
//! expansion: a node stores at most [`node::MAX_PREFIX_LEN`] prefix
//! bytes and reconstructs longer prefixes from a descendant leaf when a
//! comparison runs past the cap.
//!
//! The tree maps keys to leaves; a leaf carries key flags plus the head
//! of its value-log chain. Deletions are tombstone writes. Physical
//! leaf removal happens only when a checkpoint revert rewinds a leaf
//! head to null and the leaf has no flags left.
//!
//! Growth and shrink return the new subtree handle to the caller —
//! parents hold no back-pointers, so every structural edit bubbles up
//! through return values.

pub(crate) mod alloc;
pub(crate) mod iter;
pub(crate) mod node;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, trace};

use crate::arena::vlog::{Vlog, NULL_OFFSET};
use crate::art::alloc::ArtAllocator;
use crate::art::node::{InnerNode, Leaf, NodeKind, NodeRef, MAX_PREFIX_LEN};
use crate::error::{MemBufError, Result};
use crate::flags::{apply_flags_ops, FlagsOp, KeyFlags};
use crate::snapshot::SnapPin;

/// Sentinel meaning "no limit" for entry/buffer size caps.
pub const UNLIMITED_SIZE: u64 = u64::MAX;

/// An opaque token capturing the value-log tail and the mutation count
/// at a point in time. Tokens are only meaningful to the buffer that
/// issued them; they compare by position in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Checkpoint {
    vlog_offset: u64,
    dirty_count: u64,
}

pub(crate) struct Art {
    pub(crate) alloc: ArtAllocator,
    pub(crate) vlog: Vlog,
    pub(crate) root: NodeRef,
    /// Bumped by every mutation; iterators validate it per `next`.
    pub(crate) gen: u64,
    stages: Vec<Checkpoint>,
    dirty_count: u64,
    count: usize,
    size: usize,
    dirty: bool,
    entry_limit: u64,
    buffer_limit: u64,
    pins: Vec<Arc<SnapPin>>,
    mem_hook: Option<Arc<dyn Fn(u64) + Send + Sync>>,
}

impl Art {
    pub(crate) fn new(init_block_size: usize) -> Self {
        Art {
            alloc: ArtAllocator::new(init_block_size),
            vlog: Vlog::new(),
            root: NodeRef::NULL,
            gen: 0,
            stages: Vec::new(),
            dirty_count: 0,
            count: 0,
            size: 0,
            dirty: false,
            entry_limit: UNLIMITED_SIZE,
            buffer_limit: UNLIMITED_SIZE,
            pins: Vec::new(),
            mem_hook: None,
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// The latest value for `key`: `None` if no value was ever written,
    /// `Some(empty)` for a tombstone.
    pub(crate) fn get_entry(&self, key: &[u8]) -> Option<&[u8]> {
        let idx = self.search_leaf(key)?;
        let leaf = self.alloc.leaf(idx);
        if leaf.has_value() {
            Some(self.vlog.value_at(leaf.vlog_head))
        } else {
            None
        }
    }

    pub(crate) fn get_flags(&self, key: &[u8]) -> Option<KeyFlags> {
        self.search_leaf(key).map(|idx| self.alloc.leaf(idx).flags)
    }

    /// Descends to the leaf holding exactly `key`.
    pub(crate) fn search_leaf(&self, key: &[u8]) -> Option<u32> {
        let mut cur = self.root;
        let mut depth = 0usize;
        while !cur.is_null() {
            if cur.is_leaf() {
                return (self.alloc.leaf_key(cur.idx) == key).then_some(cur.idx);
            }
            let pl = self.alloc.inner(cur).header().prefix_len as usize;
            if pl > 0 {
                if self.prefix_matched_len(cur, key, depth) < pl {
                    return None;
                }
                depth += pl;
            }
            if depth == key.len() {
                let il = self.alloc.inner(cur).header().inplace_leaf;
                if il.is_null() {
                    return None;
                }
                return (self.alloc.leaf_key(il.idx) == key).then_some(il.idx);
            }
            let b = key[depth];
            cur = self.alloc.inner(cur).find_child(b);
            depth += 1;
        }
        None
    }

    /// How many prefix bytes of `node` match `key` at `depth`. Reads
    /// past the stored cap through a descendant leaf (lazy expansion).
    pub(crate) fn prefix_matched_len(&self, node: NodeRef, key: &[u8], depth: usize) -> usize {
        let header = self.alloc.inner(node).header();
        let pl = header.prefix_len as usize;
        let stored = header.stored_prefix();
        let check = pl.min(key.len().saturating_sub(depth));
        let mut i = 0;
        while i < check.min(stored.len()) {
            if key[depth + i] != stored[i] {
                return i;
            }
            i += 1;
        }
        if check > stored.len() {
            let lk = self.alloc.leaf_key(self.min_leaf(node));
            while i < check {
                if key[depth + i] != lk[depth + i] {
                    return i;
                }
                i += 1;
            }
        }
        i
    }

    /// The smallest leaf under `r` (the in-place leaf when present: its
    /// key is a strict prefix of every child's).
    pub(crate) fn min_leaf(&self, mut r: NodeRef) -> u32 {
        loop {
            if r.is_leaf() {
                return r.idx;
            }
            let node = self.alloc.inner(r);
            let il = node.header().inplace_leaf;
            if !il.is_null() {
                return il.idx;
            }
            let slot = node.slot_at_or_after(0).expect("inner node with no children");
            r = node.child_at(slot);
        }
    }

    /// Resolves the value a snapshot pinned at `s0` sees for `leaf`:
    /// the newest record at or before the pin, if any.
    pub(crate) fn snapshot_value(&self, leaf: &Leaf, s0: u64) -> Option<&[u8]> {
        let mut off = leaf.vlog_head;
        while off != NULL_OFFSET && off > s0 {
            off = self.vlog.record(off).prev;
        }
        if off == NULL_OFFSET {
            None
        } else {
            Some(self.vlog.value_at(off))
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub(crate) fn set_entry_size_limit(&mut self, entry_limit: u64, buffer_limit: u64) {
        self.entry_limit = if entry_limit == 0 { UNLIMITED_SIZE } else { entry_limit };
        self.buffer_limit = if buffer_limit == 0 { UNLIMITED_SIZE } else { buffer_limit };
    }

    /// Writes `value` under `key`, applying `ops` to the key flags in
    /// the same mutation. Empty values are tombstones; the façade
    /// rejects them on the public `set` path. Both size limits are
    /// checked before anything is touched, so a failed set leaves no
    /// trace.
    pub(crate) fn set(&mut self, key: &[u8], value: &[u8], ops: &[FlagsOp]) -> Result<()> {
        let entry_size = (key.len() + value.len()) as u64;
        if !value.is_empty() && entry_size > self.entry_limit {
            return Err(MemBufError::EntryTooLarge {
                limit: self.entry_limit,
                size: entry_size,
            });
        }
        let projected = match self.search_leaf(key) {
            Some(idx) if self.alloc.leaf(idx).has_value() => {
                let old = self.vlog.value_len(self.alloc.leaf(idx).vlog_head);
                self.size - old + value.len()
            }
            _ => self.size + key.len() + value.len(),
        };
        if projected as u64 > self.buffer_limit {
            return Err(MemBufError::TxnTooLarge {
                limit: self.buffer_limit,
                size: projected as u64,
            });
        }

        let leaf_idx = self.get_or_create_leaf(key);
        if !ops.is_empty() {
            let leaf = self.alloc.leaf_mut(leaf_idx);
            leaf.flags = apply_flags_ops(leaf.flags, ops);
        }
        let prev = self.alloc.leaf(leaf_idx).vlog_head;
        let offset = self.vlog.append_write(leaf_idx, prev, key, value);
        self.alloc.leaf_mut(leaf_idx).vlog_head = offset;
        if prev == NULL_OFFSET {
            self.count += 1;
            self.size += key.len() + value.len();
        } else {
            let old = self.vlog.value_len(prev);
            self.size = self.size - old + value.len();
        }
        self.dirty_count += 1;
        self.dirty = true;
        self.gen += 1;
        Ok(())
    }

    /// Applies flag deltas, materializing a flags-only leaf if needed.
    /// No value-log write and no size accounting.
    pub(crate) fn update_flags(&mut self, key: &[u8], ops: &[FlagsOp]) {
        let leaf_idx = self.get_or_create_leaf(key);
        let leaf = self.alloc.leaf_mut(leaf_idx);
        leaf.flags = apply_flags_ops(leaf.flags, ops);
        self.gen += 1;
    }

    fn get_or_create_leaf(&mut self, key: &[u8]) -> u32 {
        let (new_root, idx) = self.insert_into(self.root, key, 0);
        self.root = new_root;
        idx
    }

    /// Inserts a leaf for `key` into the subtree rooted at `r`,
    /// returning the (possibly replaced) subtree handle and the leaf.
    fn insert_into(&mut self, r: NodeRef, key: &[u8], depth: usize) -> (NodeRef, u32) {
        if r.is_null() {
            let leaf = self.alloc.alloc_leaf(key);
            return (leaf, leaf.idx);
        }

        if r.is_leaf() {
            return self.split_leaf(r, key, depth);
        }

        let pl = self.alloc.inner(r).header().prefix_len as usize;
        let matched = if pl > 0 {
            self.prefix_matched_len(r, key, depth)
        } else {
            0
        };
        if matched < pl {
            return self.split_prefix(r, key, depth, matched);
        }
        let depth = depth + pl;

        if depth == key.len() {
            let il = self.alloc.inner(r).header().inplace_leaf;
            if !il.is_null() {
                return (r, il.idx);
            }
            let leaf = self.alloc.alloc_leaf(key);
            self.alloc.inner_mut(r).header_mut().inplace_leaf = leaf;
            return (r, leaf.idx);
        }

        let b = key[depth];
        let child = self.alloc.inner(r).find_child(b);
        if child.is_null() {
            let leaf = self.alloc.alloc_leaf(key);
            let target = if self.alloc.inner(r).is_full() {
                self.alloc.grow(r)
            } else {
                r
            };
            self.alloc.inner_mut(target).add_child(b, leaf);
            return (target, leaf.idx);
        }
        let (new_child, idx) = self.insert_into(child, key, depth + 1);
        if new_child != child {
            self.alloc.inner_mut(r).replace_child(b, new_child);
        }
        (r, idx)
    }

    /// Splits an existing leaf: a fresh Node4 takes the common portion
    /// of both keys as its prefix and the two leaves as children (or as
    /// its in-place leaf when a key ends at the split point).
    fn split_leaf(&mut self, r: NodeRef, key: &[u8], depth: usize) -> (NodeRef, u32) {
        let (is_same, cpl, old_edge) = {
            let lk = self.alloc.leaf_key(r.idx);
            if lk == key {
                (true, 0, None)
            } else {
                let cpl = common_prefix_len(&lk[depth..], &key[depth..]);
                let split = depth + cpl;
                let edge = if split == lk.len() { None } else { Some(lk[split]) };
                (false, cpl, edge)
            }
        };
        if is_same {
            return (r, r.idx);
        }

        let split = depth + cpl;
        let new_leaf = self.alloc.alloc_leaf(key);
        let n4 = self.alloc.alloc_node4();
        {
            let node = self.alloc.inner_mut(n4);
            node.header_mut().set_prefix(&key[depth..split], cpl);
            match old_edge {
                Some(b) => node.add_child(b, r),
                None => node.header_mut().inplace_leaf = r,
            }
            if split == key.len() {
                node.header_mut().inplace_leaf = new_leaf;
            } else {
                node.add_child(key[split], new_leaf);
            }
        }
        (n4, new_leaf.idx)
    }

    /// Splits `r` at a prefix mismatch: a fresh Node4 keeps the common
    /// part, the old node keeps the remainder past the differing byte.
    fn split_prefix(
        &mut self,
        r: NodeRef,
        key: &[u8],
        depth: usize,
        matched: usize,
    ) -> (NodeRef, u32) {
        let full = self.load_full_prefix(r, depth);
        let pl = full.len();
        debug_assert!(matched < pl);

        let new_leaf = self.alloc.alloc_leaf(key);
        let n4 = self.alloc.alloc_node4();
        {
            let node = self.alloc.inner_mut(n4);
            node.header_mut().set_prefix(&full[..matched], matched);
            if depth + matched == key.len() {
                node.header_mut().inplace_leaf = new_leaf;
            } else {
                node.add_child(key[depth + matched], new_leaf);
            }
            node.add_child(full[matched], r);
        }
        self.alloc
            .inner_mut(r)
            .header_mut()
            .set_prefix(&full[matched + 1..], pl - matched - 1);
        (n4, new_leaf.idx)
    }

    /// The full prefix of `r`, reconstructed from a descendant leaf when
    /// it exceeds the in-node cap.
    fn load_full_prefix(&self, r: NodeRef, depth: usize) -> Vec<u8> {
        let header = self.alloc.inner(r).header();
        let pl = header.prefix_len as usize;
        if pl <= MAX_PREFIX_LEN {
            return header.stored_prefix().to_vec();
        }
        let lk = self.alloc.leaf_key(self.min_leaf(r));
        lk[depth..depth + pl].to_vec()
    }

    // ------------------------------------------------------------------
    // Staging
    // ------------------------------------------------------------------

    pub(crate) fn staging(&mut self) -> usize {
        self.stages.push(Checkpoint {
            vlog_offset: self.vlog.tail(),
            dirty_count: self.dirty_count,
        });
        trace!(handle = self.stages.len(), "staging push");
        self.stages.len()
    }

    pub(crate) fn release(&mut self, handle: usize) -> Result<()> {
        if handle != self.stages.len() || handle == 0 {
            return Err(MemBufError::StagingMisuse {
                handle,
                top: self.stages.len(),
            });
        }
        self.stages.pop();
        self.gen += 1;
        trace!(handle, "staging release");
        if self.stages.is_empty() {
            self.invalidate_all_pins();
        }
        Ok(())
    }

    pub(crate) fn cleanup(&mut self, handle: usize) -> Result<()> {
        // A handle above the stack was already released; tolerate the
        // deferred cleanup and do nothing.
        if handle > self.stages.len() {
            return Ok(());
        }
        if handle != self.stages.len() || handle == 0 {
            return Err(MemBufError::StagingMisuse {
                handle,
                top: self.stages.len(),
            });
        }
        let cp = self.stages[handle - 1];
        self.revert_to(cp.vlog_offset);
        debug_assert_eq!(self.dirty_count, cp.dirty_count);
        self.stages.pop();
        self.gen += 1;
        trace!(handle, "staging cleanup");
        if self.stages.is_empty() {
            self.invalidate_all_pins();
        }
        Ok(())
    }

    pub(crate) fn stage_depth(&self) -> usize {
        self.stages.len()
    }

    /// Log offset at which stage `handle` began.
    pub(crate) fn stage_start(&self, handle: usize) -> Option<u64> {
        if handle == 0 {
            return None;
        }
        self.stages.get(handle - 1).map(|cp| cp.vlog_offset)
    }

    /// The bare log position, used as a snapshot pin.
    pub(crate) fn checkpoint_offset(&self) -> u64 {
        self.vlog.tail()
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            vlog_offset: self.vlog.tail(),
            dirty_count: self.dirty_count,
        }
    }

    pub(crate) fn revert_to_checkpoint(&mut self, cp: &Checkpoint) {
        if cp.vlog_offset >= self.vlog.tail() {
            return;
        }
        debug!(target_offset = cp.vlog_offset, tail = self.vlog.tail(), "revert to checkpoint");
        self.revert_to(cp.vlog_offset);
        debug_assert_eq!(self.dirty_count, cp.dirty_count);
        self.gen += 1;
    }

    /// Walks the log tail down to `offset`, rewinding each record's leaf
    /// head to the previous record. A leaf rewound to null with empty
    /// flags is removed from the index.
    fn revert_to(&mut self, offset: u64) {
        for pin in &self.pins {
            if pin.s0 > offset && !pin.invalid.load(Ordering::Relaxed) {
                debug!(pinned = pin.s0, target = offset, "revert invalidates snapshot");
                pin.invalid.store(true, Ordering::Relaxed);
            }
        }
        while self.vlog.tail() > offset {
            let tail = self.vlog.tail();
            let (leaf_idx, prev, klen, vlen, start) = {
                let rec = self.vlog.record(tail);
                (rec.leaf, rec.prev, rec.key.len(), rec.value.len(), self.vlog.record_start(tail))
            };
            debug_assert_eq!(self.alloc.leaf(leaf_idx).vlog_head, tail);
            self.alloc.leaf_mut(leaf_idx).vlog_head = prev;
            if prev == NULL_OFFSET {
                self.count -= 1;
                self.size -= klen + vlen;
                if self.alloc.leaf(leaf_idx).flags.is_empty() {
                    let key = self.alloc.leaf_key(leaf_idx).to_vec();
                    self.remove_leaf(&key);
                }
            } else {
                let prev_vlen = self.vlog.value_len(prev);
                self.size = self.size - vlen + prev_vlen;
            }
            self.dirty_count -= 1;
            self.vlog.truncate(start);
        }
    }

    // ------------------------------------------------------------------
    // Leaf removal (revert path only)
    // ------------------------------------------------------------------

    fn remove_leaf(&mut self, key: &[u8]) {
        let root = self.root;
        self.root = self.remove_from(root, key, 0);
    }

    fn remove_from(&mut self, r: NodeRef, key: &[u8], depth: usize) -> NodeRef {
        debug_assert!(!r.is_null(), "removing a key that is not in the tree");
        if r.is_leaf() {
            debug_assert_eq!(self.alloc.leaf_key(r.idx), key);
            return NodeRef::NULL;
        }
        let depth = depth + self.alloc.inner(r).header().prefix_len as usize;
        if depth == key.len() {
            self.alloc.inner_mut(r).header_mut().inplace_leaf = NodeRef::NULL;
            return self.shrink_or_collapse(r);
        }
        let b = key[depth];
        let child = self.alloc.inner(r).find_child(b);
        let new_child = self.remove_from(child, key, depth + 1);
        if new_child.is_null() {
            self.alloc.inner_mut(r).remove_child(b);
            return self.shrink_or_collapse(r);
        }
        if new_child != child {
            self.alloc.inner_mut(r).replace_child(b, new_child);
        }
        r
    }

    /// Applies the post-removal structure rules to `r`: Node4 collapses
    /// into a lone child (merging prefixes when they fit the cap),
    /// larger nodes shrink once they drop below the previous capacity.
    fn shrink_or_collapse(&mut self, r: NodeRef) -> NodeRef {
        let (n, threshold, inplace) = {
            let node = self.alloc.inner(r);
            (
                node.header().num_children as usize,
                node.shrink_threshold(),
                node.header().inplace_leaf,
            )
        };
        if r.kind == NodeKind::Node4 {
            if n == 0 {
                // Only the in-place leaf (or nothing) is left.
                self.alloc.free_node(r);
                return inplace;
            }
            if n == 1 && inplace.is_null() {
                let (edge, child) = {
                    let node = self.alloc.inner(r);
                    let slot = node.slot_at_or_after(0).unwrap();
                    (node.byte_at(slot), node.child_at(slot))
                };
                if child.is_leaf() {
                    self.alloc.free_node(r);
                    return child;
                }
                let parent_pl = self.alloc.inner(r).header().prefix_len as usize;
                let child_pl = self.alloc.inner(child).header().prefix_len as usize;
                let combined = parent_pl + 1 + child_pl;
                if combined <= MAX_PREFIX_LEN {
                    let mut merged = [0u8; MAX_PREFIX_LEN];
                    merged[..parent_pl]
                        .copy_from_slice(self.alloc.inner(r).header().stored_prefix());
                    merged[parent_pl] = edge;
                    merged[parent_pl + 1..combined]
                        .copy_from_slice(self.alloc.inner(child).header().stored_prefix());
                    self.alloc
                        .inner_mut(child)
                        .header_mut()
                        .set_prefix(&merged[..combined], combined);
                    self.alloc.free_node(r);
                    return child;
                }
                // Merged prefix would overflow the cap: keep the chain.
                return r;
            }
            return r;
        }
        if n < threshold {
            return self.alloc.shrink(r);
        }
        r
    }

    // ------------------------------------------------------------------
    // Accounting & pins
    // ------------------------------------------------------------------

    pub(crate) fn len(&self) -> usize {
        self.count
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn mem(&self) -> u64 {
        (self.alloc.memory_used() + self.vlog.memory_used()) as u64
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn set_mem_hook(&mut self, hook: Arc<dyn Fn(u64) + Send + Sync>) {
        self.mem_hook = Some(hook);
    }

    pub(crate) fn mem_hook_set(&self) -> bool {
        self.mem_hook.is_some()
    }

    /// Reports the current footprint to the hook, if any. Called by the
    /// façade at the end of each mutating operation, under the writer
    /// lock; the hook must not reenter the buffer.
    pub(crate) fn notify_mem_hook(&self) {
        if let Some(hook) = &self.mem_hook {
            hook(self.mem());
        }
    }

    pub(crate) fn register_pin(&mut self, pin: Arc<SnapPin>) {
        self.pins.push(pin);
    }

    pub(crate) fn unregister_pin(&mut self, pin: &Arc<SnapPin>) {
        self.pins.retain(|p| !Arc::ptr_eq(p, pin));
    }

    fn invalidate_all_pins(&mut self) {
        for pin in &self.pins {
            if !pin.invalid.load(Ordering::Relaxed) {
                debug!(pinned = pin.s0, "stage stack emptied, snapshot invalidated");
                pin.invalid.store(true, Ordering::Relaxed);
            }
        }
    }
}

pub(crate) fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
