//! Read views pinned to the staging-level-0 state.
//!
//! A snapshot captures the value-log tail at creation; reads walk each
//! key's record chain backward past anything newer than that pin, so
//! writes that land in open stages afterwards stay invisible. The pin
//! is a registered flag the core flips when the snapshot can no longer
//! be maintained: once every stage open at creation has been released
//! or cleaned up, or a revert truncates the log below the pin. After
//! that, every operation on the snapshot fails deterministically with
//! [`MemBufError::InvalidSnapshot`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::art::iter::ArtCursor;
use crate::buffer::MemBuffer;
use crate::context::Context;
use crate::error::{MemBufError, Result};
use crate::union::KvIterator;

/// Pin registered with the core for invalidation tracking.
pub(crate) struct SnapPin {
    /// Value-log tail at snapshot creation.
    pub(crate) s0: u64,
    pub(crate) invalid: AtomicBool,
}

/// A stable read view of the buffer, created by
/// [`MemBuffer::get_snapshot`]. Dropped or closed, it releases its pin.
pub struct MemBufferSnapshot<'a> {
    buffer: &'a MemBuffer,
    pin: Arc<SnapPin>,
    closed: bool,
}

impl<'a> MemBufferSnapshot<'a> {
    pub(crate) fn pin(buffer: &'a MemBuffer) -> Self {
        let mut core = buffer.core().write();
        let pin = Arc::new(SnapPin {
            s0: core.checkpoint_offset(),
            invalid: AtomicBool::new(false),
        });
        core.register_pin(pin.clone());
        MemBufferSnapshot {
            buffer,
            pin,
            closed: false,
        }
    }

    fn check_valid(&self) -> Result<()> {
        if self.closed || self.pin.invalid.load(Ordering::Relaxed) {
            Err(MemBufError::InvalidSnapshot)
        } else {
            Ok(())
        }
    }

    /// The pinned value for `key`; tombstones and keys first written
    /// after the pin read as [`MemBufError::NotExist`].
    pub fn get(&self, cx: &Context, key: &[u8]) -> Result<Vec<u8>> {
        cx.check()?;
        let core = self.buffer.core().read_recursive();
        self.check_valid()?;
        let idx = core.search_leaf(key).ok_or(MemBufError::NotExist)?;
        let leaf = *core.alloc.leaf(idx);
        match core.snapshot_value(&leaf, self.pin.s0) {
            Some(v) if !v.is_empty() => Ok(v.to_vec()),
            _ => Err(MemBufError::NotExist),
        }
    }

    /// Visits every pinned (key, value) in `[lower, upper)` (downward
    /// from `upper` when `reverse`), holding the read lock for the whole
    /// traversal. The visitor returns `Ok(true)` to stop early. Use this
    /// for full-range scans; prefer [`Self::batched_iter`] for
    /// on-demand iteration.
    pub fn for_each_range(
        &self,
        cx: &Context,
        lower: &[u8],
        upper: &[u8],
        reverse: bool,
        mut f: impl FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        cx.check()?;
        let core = self.buffer.core().read_recursive();
        self.check_valid()?;
        let mut cursor = if reverse {
            ArtCursor::new_reverse(&core, upper)
        } else {
            ArtCursor::new_forward(&core, lower)
        };
        while let Some(idx) = cursor.current_leaf() {
            cx.check()?;
            let key = core.alloc.leaf_key(idx);
            let done = if reverse {
                !lower.is_empty() && key < lower
            } else {
                !upper.is_empty() && key >= upper
            };
            if done {
                break;
            }
            let leaf = *core.alloc.leaf(idx);
            if let Some(v) = core.snapshot_value(&leaf, self.pin.s0) {
                if !v.is_empty() && f(key, v)? {
                    break;
                }
            }
            cursor.advance(&core);
        }
        Ok(())
    }

    /// An iterator over the pinned state that materializes one batch of
    /// entries at a time and releases the read lock in between, so
    /// writers can make progress during long scans. Each batch resumes
    /// strictly after the last emitted key; if the pin is invalidated
    /// between batches the iterator fails with
    /// [`MemBufError::InvalidSnapshot`] instead of returning torn data.
    pub fn batched_iter(
        &self,
        cx: &Context,
        lower: &[u8],
        upper: &[u8],
        reverse: bool,
    ) -> Result<BatchedSnapshotIter<'a, '_>> {
        let mut iter = BatchedSnapshotIter {
            snapshot: self,
            cx: cx.clone(),
            lower: lower.to_vec(),
            upper: upper.to_vec(),
            reverse,
            batch_size: self.buffer.options().snapshot_batch_size.max(1),
            batch: Vec::new(),
            pos: 0,
            resume: None,
            exhausted: false,
            errored: false,
        };
        iter.refill()?;
        Ok(iter)
    }

    /// Drops the pin. Also happens on drop; the explicit form exists
    /// for callers that want to release before the borrow ends.
    pub fn close(self) {}
}

impl Drop for MemBufferSnapshot<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.buffer.core().write().unregister_pin(&self.pin);
        }
    }
}

/// Batched iterator over a snapshot; see
/// [`MemBufferSnapshot::batched_iter`].
pub struct BatchedSnapshotIter<'a, 'b> {
    snapshot: &'b MemBufferSnapshot<'a>,
    cx: Context,
    lower: Vec<u8>,
    upper: Vec<u8>,
    reverse: bool,
    batch_size: usize,
    batch: Vec<(Vec<u8>, Vec<u8>)>,
    pos: usize,
    /// Last emitted key; the next batch starts strictly past it.
    resume: Option<Vec<u8>>,
    exhausted: bool,
    errored: bool,
}

impl BatchedSnapshotIter<'_, '_> {
    fn refill(&mut self) -> Result<()> {
        self.batch.clear();
        self.pos = 0;
        if self.exhausted {
            return Ok(());
        }
        self.cx.check()?;
        let core = self.snapshot.buffer.core().read_recursive();
        if let Err(err) = self.snapshot.check_valid() {
            self.errored = true;
            return Err(err);
        }

        let mut cursor = if self.reverse {
            let upper = self.resume.as_deref().unwrap_or(&self.upper);
            ArtCursor::new_reverse(&core, upper)
        } else {
            let lower = self.resume.as_deref().unwrap_or(&self.lower);
            ArtCursor::new_forward(&core, lower)
        };
        while let Some(idx) = cursor.current_leaf() {
            self.cx.check()?;
            let key = core.alloc.leaf_key(idx);
            let done = if self.reverse {
                !self.lower.is_empty() && key < self.lower.as_slice()
            } else {
                !self.upper.is_empty() && key >= self.upper.as_slice()
            };
            if done {
                break;
            }
            // Forward resume lands on the last emitted key; step past it.
            if self.resume.as_deref() != Some(key) {
                let leaf = *core.alloc.leaf(idx);
                if let Some(v) = core.snapshot_value(&leaf, self.snapshot.pin.s0) {
                    if !v.is_empty() {
                        self.batch.push((key.to_vec(), v.to_vec()));
                        if self.batch.len() == self.batch_size {
                            break;
                        }
                    }
                }
            }
            cursor.advance(&core);
        }
        if self.batch.len() < self.batch_size {
            self.exhausted = true;
        }
        if let Some((k, _)) = self.batch.last() {
            self.resume = Some(k.clone());
        }
        Ok(())
    }
}

impl KvIterator for BatchedSnapshotIter<'_, '_> {
    fn valid(&self) -> bool {
        self.pos < self.batch.len()
    }

    fn key(&self) -> &[u8] {
        self.batch.get(self.pos).map(|(k, _)| k.as_slice()).unwrap_or(b"")
    }

    fn value(&self) -> &[u8] {
        self.batch.get(self.pos).map(|(_, v)| v.as_slice()).unwrap_or(b"")
    }

    fn next(&mut self) -> Result<()> {
        if self.errored {
            return Err(MemBufError::InvalidSnapshot);
        }
        if !self.valid() {
            return Ok(());
        }
        self.pos += 1;
        if self.pos >= self.batch.len() && !self.exhausted {
            self.refill()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Options;

    fn cx() -> Context {
        Context::none()
    }

    #[test]
    fn test_snapshot_sees_prestaging_state() {
        let buf = MemBuffer::new();
        buf.set(b"k", b"v1").unwrap();
        let h = buf.staging();
        let snap = buf.get_snapshot();
        buf.set(b"k", b"v2").unwrap();
        buf.set(b"new", b"x").unwrap();

        assert_eq!(snap.get(&cx(), b"k").unwrap(), b"v1");
        assert_eq!(snap.get(&cx(), b"new"), Err(MemBufError::NotExist));
        // The live buffer sees the staged writes.
        assert_eq!(buf.get(&cx(), b"k").unwrap(), b"v2");
        drop(snap);
        buf.cleanup(h).unwrap();
    }

    #[test]
    fn test_release_of_last_stage_invalidates() {
        let buf = MemBuffer::new();
        buf.set(b"k", b"v1").unwrap();
        let h = buf.staging();
        let snap = buf.get_snapshot();
        buf.set(b"k", b"v2").unwrap();
        buf.release(h).unwrap();
        assert_eq!(snap.get(&cx(), b"k"), Err(MemBufError::InvalidSnapshot));
    }

    #[test]
    fn test_cleanup_of_last_stage_invalidates() {
        let buf = MemBuffer::new();
        buf.set(b"k", b"v1").unwrap();
        let h = buf.staging();
        let snap = buf.get_snapshot();
        buf.cleanup(h).unwrap();
        assert_eq!(snap.get(&cx(), b"k"), Err(MemBufError::InvalidSnapshot));
    }

    #[test]
    fn test_inner_stage_cleanup_keeps_snapshot_valid() {
        let buf = MemBuffer::new();
        buf.set(b"k", b"v1").unwrap();
        let h1 = buf.staging();
        let snap = buf.get_snapshot();
        let h2 = buf.staging();
        buf.set(b"k", b"v2").unwrap();
        buf.cleanup(h2).unwrap();
        assert_eq!(snap.get(&cx(), b"k").unwrap(), b"v1");
        drop(snap);
        buf.release(h1).unwrap();
    }

    #[test]
    fn test_revert_crossing_pin_invalidates() {
        let buf = MemBuffer::new();
        let t = buf.checkpoint();
        buf.set(b"k", b"v1").unwrap();
        let snap = buf.get_snapshot();
        buf.revert_to_checkpoint(&t);
        assert_eq!(snap.get(&cx(), b"k"), Err(MemBufError::InvalidSnapshot));
    }

    #[test]
    fn test_snapshot_skips_tombstones() {
        let buf = MemBuffer::new();
        buf.set(b"k", b"v").unwrap();
        buf.delete(b"k").unwrap();
        let snap = buf.get_snapshot();
        assert_eq!(snap.get(&cx(), b"k"), Err(MemBufError::NotExist));
    }

    #[test]
    fn test_for_each_range_and_early_stop() {
        let buf = MemBuffer::new();
        for (k, v) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3"), (b"d", b"4")] {
            buf.set(k, v).unwrap();
        }
        let h = buf.staging();
        buf.set(b"b", b"staged").unwrap();
        let snap = buf.get_snapshot();

        let mut seen = Vec::new();
        snap.for_each_range(&cx(), b"a", b"d", false, |k, v| {
            seen.push((k.to_vec(), v.to_vec()));
            Ok(false)
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );

        let mut count = 0;
        snap.for_each_range(&cx(), b"", b"", true, |_, _| {
            count += 1;
            Ok(count == 2)
        })
        .unwrap();
        assert_eq!(count, 2);

        drop(snap);
        buf.cleanup(h).unwrap();
    }

    #[test]
    fn test_batched_iter_tolerates_interleaved_writes() {
        let buf = MemBuffer::with_options(Options {
            snapshot_batch_size: 2,
            ..Options::default()
        });
        for i in 0..7u8 {
            buf.set(&[b'k', b'0' + i], &[i]).unwrap();
        }
        let h = buf.staging();
        let snap = buf.get_snapshot();
        let mut it = snap.batched_iter(&cx(), b"", b"", false).unwrap();

        let mut seen = Vec::new();
        let mut wrote = false;
        while it.valid() {
            seen.push(it.key().to_vec());
            if !wrote {
                // A write landing between batches must not disturb the
                // pinned view.
                buf.set(b"k9", b"late").unwrap();
                wrote = true;
            }
            it.next().unwrap();
        }
        let expect: Vec<Vec<u8>> = (0..7u8).map(|i| vec![b'k', b'0' + i]).collect();
        assert_eq!(seen, expect);
        drop(snap);
        buf.cleanup(h).unwrap();
    }

    #[test]
    fn test_batched_iter_reverse() {
        let buf = MemBuffer::with_options(Options {
            snapshot_batch_size: 2,
            ..Options::default()
        });
        for k in [b"a", b"b", b"c", b"d", b"e"] {
            buf.set(k, b"v").unwrap();
        }
        let snap = buf.get_snapshot();
        let mut it = snap.batched_iter(&cx(), b"b", b"e", true).unwrap();
        let mut seen = Vec::new();
        while it.valid() {
            seen.push(it.key().to_vec());
            it.next().unwrap();
        }
        assert_eq!(seen, vec![b"d".to_vec(), b"c".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_batched_iter_fails_after_invalidation() {
        let buf = MemBuffer::with_options(Options {
            snapshot_batch_size: 1,
            ..Options::default()
        });
        buf.set(b"a", b"1").unwrap();
        buf.set(b"b", b"2").unwrap();
        let h = buf.staging();
        let snap = buf.get_snapshot();
        let mut it = snap.batched_iter(&cx(), b"", b"", false).unwrap();
        assert!(it.valid());

        buf.release(h).unwrap();
        assert_eq!(it.next(), Err(MemBufError::InvalidSnapshot));
        assert_eq!(it.next(), Err(MemBufError::InvalidSnapshot));
    }

    #[test]
    fn test_closed_snapshot_errors() {
        let buf = MemBuffer::new();
        buf.set(b"a", b"1").unwrap();
        let snap = buf.get_snapshot();
        assert_eq!(snap.get(&cx(), b"a").unwrap(), b"1");
        snap.close();
        // A fresh snapshot still works after the old pin is gone.
        let snap2 = buf.get_snapshot();
        assert_eq!(snap2.get(&cx(), b"a").unwrap(), b"1");
    }
}
