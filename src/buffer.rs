//! The MemBuffer façade.
//!
//! One reader/writer lock guards each buffer instance: one writer or
//! many readers, no internal queues. Mutations are totally ordered by
//! writer lock acquisition. Iterators do not hold the lock between
//! `next` calls; instead every advance re-acquires the read lock and
//! validates the index generation, failing deterministically with
//! [`MemBufError::IteratorInvalidated`] if any write happened in
//! between.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::debug;

use crate::arena::INIT_BLOCK_SIZE;
use crate::art::iter::ArtCursor;
use crate::art::{Art, Checkpoint};
use crate::context::Context;
use crate::error::{MemBufError, Result};
use crate::flags::{FlagsOp, KeyFlags};
use crate::snapshot::MemBufferSnapshot;
use crate::union::KvIterator;

/// Tuning knobs for a buffer instance.
#[derive(Debug, Clone)]
pub struct Options {
    /// Capacity of the first arena block; subsequent blocks double up
    /// to the 4 MiB cap.
    pub init_block_size: usize,
    /// Entries materialized per batch by snapshot batched iterators.
    pub snapshot_batch_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            init_block_size: INIT_BLOCK_SIZE,
            snapshot_batch_size: 256,
        }
    }
}

/// An in-memory transactional write buffer.
///
/// All writes of a transaction are staged here; reads union the buffer
/// with a remote snapshot (see [`crate::union::UnionStore`]). The buffer
/// guarantees that a transaction sees its own writes and that later
/// writes shadow earlier ones.
pub struct MemBuffer {
    core: RwLock<Art>,
    options: Options,
}

impl MemBuffer {
    /// An empty buffer with default [`Options`].
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    /// An empty buffer with the given tuning knobs.
    pub fn with_options(options: Options) -> Self {
        MemBuffer {
            core: RwLock::new(Art::new(options.init_block_size)),
            options,
        }
    }

    pub(crate) fn core(&self) -> &RwLock<Art> {
        &self.core
    }

    pub(crate) fn options(&self) -> &Options {
        &self.options
    }

    /// Acquires the shared read lock for a sequence of reads. Individual
    /// read operations lock on their own; hold this only to get a
    /// consistent multi-read view without writer interleaving.
    pub fn rlock(&self) -> BufferReadGuard<'_> {
        BufferReadGuard {
            _guard: self.core.read_recursive(),
        }
    }

    // ------------------------------------------------------------------
    // Point reads
    // ------------------------------------------------------------------

    /// The latest value for `key`. Absent keys and deletion tombstones
    /// both read as [`MemBufError::NotExist`].
    pub fn get(&self, cx: &Context, key: &[u8]) -> Result<Vec<u8>> {
        cx.check()?;
        let core = self.core.read_recursive();
        match core.get_entry(key) {
            Some(v) if !v.is_empty() => Ok(v.to_vec()),
            Some(_) => Err(MemBufError::NotExist),
            None => Err(MemBufError::NotExist),
        }
    }

    /// The buffered entry for `key`, if any: `Some(empty)` is a
    /// deletion tombstone. This is the read the union store and the
    /// commit path use, where "locally deleted" and "not buffered"
    /// must stay distinguishable.
    pub fn get_entry(&self, key: &[u8]) -> Option<Vec<u8>> {
        let core = self.core.read_recursive();
        core.get_entry(key).map(|v| v.to_vec())
    }

    /// Sequential [`Self::get_entry`] per key. Keys without a buffered
    /// entry are left out of the map; tombstones are included as empty
    /// values.
    pub fn batch_get(&self, cx: &Context, keys: &[&[u8]]) -> Result<HashMap<Vec<u8>, Vec<u8>>> {
        let core = self.core.read_recursive();
        let mut out = HashMap::new();
        for key in keys {
            cx.check()?;
            if let Some(v) = core.get_entry(key) {
                out.insert(key.to_vec(), v.to_vec());
            }
        }
        Ok(out)
    }

    /// The flags for `key`; [`MemBufError::NotExist`] only when no leaf
    /// exists at all (a tombstoned key still has flags).
    pub fn get_flags(&self, key: &[u8]) -> Result<KeyFlags> {
        let core = self.core.read_recursive();
        core.get_flags(key).ok_or(MemBufError::NotExist)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Writes `value` under `key`. Empty values are rejected; use
    /// [`Self::delete`] for deletions.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.set_with_flags(key, value, &[])
    }

    /// A single write that both updates the value and applies flag ops.
    pub fn set_with_flags(&self, key: &[u8], value: &[u8], ops: &[FlagsOp]) -> Result<()> {
        if value.is_empty() {
            return Err(MemBufError::CannotSetEmptyValue);
        }
        let mut core = self.core.write();
        core.set(key, value, ops)?;
        core.notify_mem_hook();
        Ok(())
    }

    /// Marks `key` deleted by writing a tombstone. The key stays in the
    /// buffer so the deletion shadows the remote snapshot and gets
    /// committed.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.delete_with_flags(key, &[])
    }

    /// Deletes `key` and applies flag ops in the same mutation.
    pub fn delete_with_flags(&self, key: &[u8], ops: &[FlagsOp]) -> Result<()> {
        let mut core = self.core.write();
        core.set(key, b"", ops)?;
        core.notify_mem_hook();
        Ok(())
    }

    /// Applies flag deltas in order, materializing a flags-only leaf if
    /// the key has never been written.
    pub fn update_flags(&self, key: &[u8], ops: &[FlagsOp]) {
        let mut core = self.core.write();
        core.update_flags(key, ops);
        core.notify_mem_hook();
    }

    /// Sets the per-entry and total size caps, in bytes. Zero disables
    /// a cap.
    pub fn set_entry_size_limit(&self, entry_limit: u64, buffer_limit: u64) {
        self.core.write().set_entry_size_limit(entry_limit, buffer_limit);
    }

    // ------------------------------------------------------------------
    // Staging
    // ------------------------------------------------------------------

    /// Pushes a staging checkpoint and returns its 1-based handle.
    pub fn staging(&self) -> usize {
        self.core.write().staging()
    }

    /// Publishes the top stage into its parent. `handle` must be the
    /// top of the stack.
    pub fn release(&self, handle: usize) -> Result<()> {
        self.core.write().release(handle)
    }

    /// Discards every write of the top stage, restoring the state at
    /// the matching [`Self::staging`] call. A handle above the stack
    /// (already released) is a no-op.
    pub fn cleanup(&self, handle: usize) -> Result<()> {
        let mut core = self.core.write();
        core.cleanup(handle)?;
        core.notify_mem_hook();
        Ok(())
    }

    /// Current staging depth, mostly for assertions in callers.
    pub fn stage_depth(&self) -> usize {
        self.core.read_recursive().stage_depth()
    }

    /// Captures the current log position as an opaque token.
    pub fn checkpoint(&self) -> Checkpoint {
        self.core.read_recursive().checkpoint()
    }

    /// Reverts every write made after `cp` was captured. Snapshots
    /// whose pin lies past the target are invalidated.
    pub fn revert_to_checkpoint(&self, cp: &Checkpoint) {
        let mut core = self.core.write();
        core.revert_to_checkpoint(cp);
        core.notify_mem_hook();
    }

    /// Visits every (key, flags, value) of stage `handle` in key order.
    /// Tombstones and flags-only leaves are visited with an empty value.
    pub fn inspect_stage(
        &self,
        handle: usize,
        mut f: impl FnMut(&[u8], KeyFlags, &[u8]),
    ) -> Result<()> {
        let core = self.core.read_recursive();
        let Some(start) = core.stage_start(handle) else {
            return Err(MemBufError::StagingMisuse {
                handle,
                top: core.stage_depth(),
            });
        };
        let mut cursor = ArtCursor::new_forward(&core, b"");
        while let Some(idx) = cursor.current_leaf() {
            let leaf = *core.alloc.leaf(idx);
            let key = core.alloc.leaf_key(idx);
            if leaf.has_value() {
                if leaf.vlog_head > start {
                    f(key, leaf.flags, core.vlog.value_at(leaf.vlog_head));
                }
            } else if !leaf.flags.is_empty() {
                f(key, leaf.flags, b"");
            }
            cursor.advance(&core);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Iteration
    // ------------------------------------------------------------------

    /// Forward scan over `[lower, upper)`; an empty bound means
    /// unbounded on that side. Tombstones and flags-only leaves are
    /// skipped. Any mutation invalidates the iterator.
    pub fn iter(&self, cx: &Context, lower: &[u8], upper: &[u8]) -> Result<BufferIter<'_>> {
        self.make_iter(cx, lower, upper, false, false)
    }

    /// Reverse scan from `upper` (exclusive) down to `lower`
    /// (inclusive); empty bounds are unbounded.
    pub fn iter_reverse(&self, cx: &Context, upper: &[u8], lower: &[u8]) -> Result<BufferIter<'_>> {
        self.make_iter(cx, lower, upper, true, false)
    }

    /// Like [`Self::iter`]/[`Self::iter_reverse`] but yielding deletion
    /// tombstones as empty values. This is the iterator the union store
    /// composes with a remote snapshot and the commit path drains.
    pub fn iter_all(
        &self,
        cx: &Context,
        lower: &[u8],
        upper: &[u8],
        reverse: bool,
    ) -> Result<BufferIter<'_>> {
        self.make_iter(cx, lower, upper, reverse, true)
    }

    fn make_iter(
        &self,
        cx: &Context,
        lower: &[u8],
        upper: &[u8],
        reverse: bool,
        include_tombstones: bool,
    ) -> Result<BufferIter<'_>> {
        cx.check()?;
        let core = self.core.read_recursive();
        let cursor = if reverse {
            ArtCursor::new_reverse(&core, upper)
        } else {
            ArtCursor::new_forward(&core, lower)
        };
        let mut iter = BufferIter {
            buffer: self,
            cursor,
            gen: core.gen,
            reverse,
            lower: lower.to_vec(),
            upper: upper.to_vec(),
            include_tombstones,
            entry: None,
            invalidated: false,
        };
        iter.fill_current(&core);
        Ok(iter)
    }

    // ------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------

    /// Returns a read view pinned to the staging-level-0 state. The
    /// snapshot stays valid across ordinary writes; it is invalidated
    /// once every stage open at creation time has been released or
    /// cleaned up, or a revert crosses its pinned sequence number.
    pub fn get_snapshot(&self) -> MemBufferSnapshot<'_> {
        MemBufferSnapshot::pin(self)
    }

    // ------------------------------------------------------------------
    // Flush collaborator
    // ------------------------------------------------------------------

    /// This buffer is the non-pipelined variant: nothing is sent out
    /// before commit, so `flush` never flushes.
    pub fn flush(&self, force: bool) -> Result<bool> {
        debug!(force, "flush requested on a non-pipelined buffer");
        Ok(false)
    }

    /// Companion to [`Self::flush`]; there is never an in-flight flush
    /// to wait for.
    pub fn flush_wait(&self) -> Result<()> {
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------

    /// Total bytes held by the buffer (arena blocks, node slabs, value
    /// log).
    pub fn mem(&self) -> u64 {
        self.core.read_recursive().mem()
    }

    /// Number of keys with a buffered value (tombstones included,
    /// flags-only leaves not).
    pub fn len(&self) -> usize {
        self.core.read_recursive().len()
    }

    /// Logical byte size: sum of key+value lengths of the latest
    /// version of each buffered key.
    pub fn size(&self) -> usize {
        self.core.read_recursive().size()
    }

    /// Whether the buffer holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once any value write happened (flag-only updates do not
    /// count).
    pub fn dirty(&self) -> bool {
        self.core.read_recursive().is_dirty()
    }

    /// Installs a hook invoked with the new [`Self::mem`] after each
    /// mutating operation, under the writer lock. The hook must not
    /// reenter the buffer.
    pub fn set_memory_footprint_hook(&self, hook: Arc<dyn Fn(u64) + Send + Sync>) {
        self.core.write().set_mem_hook(hook);
    }

    /// Whether a memory footprint hook is installed.
    pub fn mem_hook_set(&self) -> bool {
        self.core.read_recursive().mem_hook_set()
    }
}

impl Default for MemBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by [`MemBuffer::rlock`].
pub struct BufferReadGuard<'a> {
    _guard: RwLockReadGuard<'a, Art>,
}

/// An ordered iterator over the buffer.
///
/// Holds no lock between `next` calls; every advance re-locks and
/// checks the index generation, so a mutation between two calls turns
/// into [`MemBufError::IteratorInvalidated`] instead of corrupt output.
pub struct BufferIter<'a> {
    buffer: &'a MemBuffer,
    cursor: ArtCursor,
    gen: u64,
    reverse: bool,
    lower: Vec<u8>,
    upper: Vec<u8>,
    include_tombstones: bool,
    entry: Option<(Vec<u8>, Vec<u8>)>,
    invalidated: bool,
}

impl BufferIter<'_> {
    /// Materializes the first in-bounds, non-skipped leaf at or after
    /// the cursor position.
    fn fill_current(&mut self, core: &Art) {
        self.entry = None;
        while let Some(idx) = self.cursor.current_leaf() {
            let leaf = *core.alloc.leaf(idx);
            let key = core.alloc.leaf_key(idx);
            if self.out_of_bounds(key) {
                return;
            }
            if leaf.has_value() {
                let value = core.vlog.value_at(leaf.vlog_head);
                if self.include_tombstones || !value.is_empty() {
                    self.entry = Some((key.to_vec(), value.to_vec()));
                    return;
                }
            }
            // Flags-only leaf or filtered tombstone.
            self.cursor.advance(core);
        }
    }

    fn out_of_bounds(&self, key: &[u8]) -> bool {
        if self.reverse {
            !self.lower.is_empty() && key < self.lower.as_slice()
        } else {
            !self.upper.is_empty() && key >= self.upper.as_slice()
        }
    }
}

impl KvIterator for BufferIter<'_> {
    fn valid(&self) -> bool {
        self.entry.is_some()
    }

    fn key(&self) -> &[u8] {
        self.entry.as_ref().map(|(k, _)| k.as_slice()).unwrap_or(b"")
    }

    fn value(&self) -> &[u8] {
        self.entry.as_ref().map(|(_, v)| v.as_slice()).unwrap_or(b"")
    }

    fn next(&mut self) -> Result<()> {
        if self.invalidated {
            return Err(MemBufError::IteratorInvalidated);
        }
        if self.entry.is_none() {
            return Ok(());
        }
        let core = self.buffer.core.read_recursive();
        if core.gen != self.gen {
            self.invalidated = true;
            self.entry = None;
            return Err(MemBufError::IteratorInvalidated);
        }
        self.cursor.advance(&core);
        self.fill_current(&core);
        Ok(())
    }
}
