//! Union of the local write buffer and a remote read-only snapshot.
//!
//! The union enforces the transaction guarantees: a transaction sees
//! its own writes, and its writes shadow the snapshot. Buffer
//! tombstones hide remote entries and are never emitted themselves.

use std::collections::HashMap;

use crate::buffer::{BufferIter, MemBuffer};
use crate::context::Context;
use crate::error::{MemBufError, Result};
use crate::flags::FlagsOp;

/// The iterator shape shared by the buffer, remote snapshots and the
/// union itself. Ordering is lexicographic; `key`/`value` are only
/// meaningful while `valid` is true. Resources are released on drop.
pub trait KvIterator {
    /// Whether the iterator currently points at an entry.
    fn valid(&self) -> bool;
    /// The current key.
    fn key(&self) -> &[u8];
    /// The current value.
    fn value(&self) -> &[u8];
    /// Advances to the next entry in the iterator's direction.
    fn next(&mut self) -> Result<()>;
}

/// A remote read-only snapshot of the store.
///
/// `iter` positions at the first entry with key >= `from` and yields
/// keys below `upper`; `iter_reverse` positions at the last entry with
/// key < `from` and yields keys at or above `lower`. Empty bounds are
/// unbounded, matching the buffer's convention.
pub trait RemoteSnapshot {
    /// Iterator type produced by both scan directions.
    type Iter: KvIterator;

    /// The committed value for `key`, or [`MemBufError::NotExist`].
    fn get(&self, cx: &Context, key: &[u8]) -> Result<Vec<u8>>;

    /// Forward scan from `from` (inclusive) below `upper`.
    fn iter(&self, from: &[u8], upper: &[u8]) -> Result<Self::Iter>;

    /// Reverse scan from `from` (exclusive) down to `lower`.
    fn iter_reverse(&self, from: &[u8], lower: &[u8]) -> Result<Self::Iter>;
}

/// An in-memory store unioning a write buffer with a remote snapshot.
pub struct UnionStore<S: RemoteSnapshot> {
    buffer: MemBuffer,
    snapshot: S,
}

impl<S: RemoteSnapshot> UnionStore<S> {
    /// Binds a write buffer to a remote snapshot.
    pub fn new(buffer: MemBuffer, snapshot: S) -> Self {
        UnionStore { buffer, snapshot }
    }

    /// The write buffer bound to this store.
    pub fn mem_buffer(&self) -> &MemBuffer {
        &self.buffer
    }

    /// Reads `key`, buffer first. A buffered tombstone hides the key
    /// without consulting the snapshot.
    pub fn get(&self, cx: &Context, key: &[u8]) -> Result<Vec<u8>> {
        cx.check()?;
        let value = match self.buffer.get_entry(key) {
            Some(v) => v,
            None => self.snapshot.get(cx, key)?,
        };
        if value.is_empty() {
            return Err(MemBufError::NotExist);
        }
        Ok(value)
    }

    /// Batched [`Self::get`]: buffered entries are answered locally,
    /// the rest fall through to the snapshot. Keys that exist nowhere
    /// (or are deleted locally) are left out.
    pub fn batch_get(&self, cx: &Context, keys: &[&[u8]]) -> Result<HashMap<Vec<u8>, Vec<u8>>> {
        let mut out = HashMap::new();
        for key in keys {
            match self.get(cx, key) {
                Ok(v) => {
                    out.insert(key.to_vec(), v);
                }
                Err(MemBufError::NotExist) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    /// Forward merged scan over `[lower, upper)`.
    pub fn iter(
        &self,
        cx: &Context,
        lower: &[u8],
        upper: &[u8],
    ) -> Result<UnionIter<BufferIter<'_>, S::Iter>> {
        let buffer_it = self.buffer.iter_all(cx, lower, upper, false)?;
        let snap_it = self.snapshot.iter(lower, upper)?;
        UnionIter::new(buffer_it, snap_it, false)
    }

    /// Reverse merged scan from `upper` (exclusive) down to `lower`.
    pub fn iter_reverse(
        &self,
        cx: &Context,
        upper: &[u8],
        lower: &[u8],
    ) -> Result<UnionIter<BufferIter<'_>, S::Iter>> {
        let buffer_it = self.buffer.iter_all(cx, lower, upper, true)?;
        let snap_it = self.snapshot.iter_reverse(upper, lower)?;
        UnionIter::new(buffer_it, snap_it, true)
    }

    /// Whether the lazy existence check is pending for `key`.
    pub fn has_presume_key_not_exists(&self, key: &[u8]) -> bool {
        self.buffer
            .get_flags(key)
            .map(|f| f.has_presume_key_not_exists())
            .unwrap_or(false)
    }

    /// Clears the lazy existence check mark for `key`.
    pub fn unmark_presume_key_not_exists(&self, key: &[u8]) {
        self.buffer
            .update_flags(key, &[FlagsOp::DelPresumeKeyNotExists]);
    }

    /// Forwards the per-entry and total size caps to the buffer; zero
    /// disables a cap.
    pub fn set_entry_size_limit(&self, entry_limit: u64, buffer_limit: u64) {
        self.buffer.set_entry_size_limit(entry_limit, buffer_limit);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cur {
    /// Emit the buffer side.
    Buffer,
    /// Emit the buffer side; both sides sit on the same key.
    Both,
    /// Emit the snapshot side.
    Snapshot,
    Exhausted,
}

/// Merges two ordered iterators under own-writes-win semantics: on
/// equal keys the buffer entry shadows the snapshot entry, and buffer
/// tombstones (empty values) are skipped together with whatever they
/// shadow. Errors from either side propagate.
pub struct UnionIter<B: KvIterator, S: KvIterator> {
    buffer_it: B,
    snap_it: S,
    reverse: bool,
    cur: Cur,
}

impl<B: KvIterator, S: KvIterator> UnionIter<B, S> {
    /// Merges two same-direction iterators over identical bounds.
    pub fn new(buffer_it: B, snap_it: S, reverse: bool) -> Result<Self> {
        let mut iter = UnionIter {
            buffer_it,
            snap_it,
            reverse,
            cur: Cur::Exhausted,
        };
        iter.update_cur()?;
        Ok(iter)
    }

    fn update_cur(&mut self) -> Result<()> {
        loop {
            self.cur = match (self.buffer_it.valid(), self.snap_it.valid()) {
                (false, false) => Cur::Exhausted,
                (true, false) => {
                    if self.buffer_it.value().is_empty() {
                        self.buffer_it.next()?;
                        continue;
                    }
                    Cur::Buffer
                }
                (false, true) => Cur::Snapshot,
                (true, true) => {
                    let ord = self.buffer_it.key().cmp(self.snap_it.key());
                    let ord = if self.reverse { ord.reverse() } else { ord };
                    match ord {
                        std::cmp::Ordering::Less => {
                            if self.buffer_it.value().is_empty() {
                                self.buffer_it.next()?;
                                continue;
                            }
                            Cur::Buffer
                        }
                        std::cmp::Ordering::Greater => Cur::Snapshot,
                        std::cmp::Ordering::Equal => {
                            if self.buffer_it.value().is_empty() {
                                // A deletion shadowing a snapshot entry:
                                // skip both.
                                self.buffer_it.next()?;
                                self.snap_it.next()?;
                                continue;
                            }
                            Cur::Both
                        }
                    }
                }
            };
            return Ok(());
        }
    }
}

impl<B: KvIterator, S: KvIterator> KvIterator for UnionIter<B, S> {
    fn valid(&self) -> bool {
        self.cur != Cur::Exhausted
    }

    fn key(&self) -> &[u8] {
        match self.cur {
            Cur::Buffer | Cur::Both => self.buffer_it.key(),
            Cur::Snapshot => self.snap_it.key(),
            Cur::Exhausted => b"",
        }
    }

    fn value(&self) -> &[u8] {
        match self.cur {
            Cur::Buffer | Cur::Both => self.buffer_it.value(),
            Cur::Snapshot => self.snap_it.value(),
            Cur::Exhausted => b"",
        }
    }

    fn next(&mut self) -> Result<()> {
        match self.cur {
            Cur::Buffer => self.buffer_it.next()?,
            Cur::Both => {
                self.buffer_it.next()?;
                self.snap_it.next()?;
            }
            Cur::Snapshot => self.snap_it.next()?,
            Cur::Exhausted => return Ok(()),
        }
        self.update_cur()
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use std::collections::BTreeMap;

    /// BTreeMap-backed stand-in for the remote side.
    pub(crate) struct MockSnapshot {
        pub map: BTreeMap<Vec<u8>, Vec<u8>>,
    }

    impl MockSnapshot {
        pub(crate) fn from_pairs(pairs: &[(&[u8], &[u8])]) -> Self {
            MockSnapshot {
                map: pairs
                    .iter()
                    .map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .collect(),
            }
        }
    }

    pub(crate) struct MockIter {
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        pos: usize,
    }

    impl KvIterator for MockIter {
        fn valid(&self) -> bool {
            self.pos < self.entries.len()
        }

        fn key(&self) -> &[u8] {
            &self.entries[self.pos].0
        }

        fn value(&self) -> &[u8] {
            &self.entries[self.pos].1
        }

        fn next(&mut self) -> Result<()> {
            if self.valid() {
                self.pos += 1;
            }
            Ok(())
        }
    }

    impl RemoteSnapshot for MockSnapshot {
        type Iter = MockIter;

        fn get(&self, _cx: &Context, key: &[u8]) -> Result<Vec<u8>> {
            self.map.get(key).cloned().ok_or(MemBufError::NotExist)
        }

        fn iter(&self, from: &[u8], upper: &[u8]) -> Result<MockIter> {
            let entries = self
                .map
                .iter()
                .filter(|(k, _)| k.as_slice() >= from)
                .filter(|(k, _)| upper.is_empty() || k.as_slice() < upper)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Ok(MockIter { entries, pos: 0 })
        }

        fn iter_reverse(&self, from: &[u8], lower: &[u8]) -> Result<MockIter> {
            let mut entries: Vec<_> = self
                .map
                .iter()
                .filter(|(k, _)| from.is_empty() || k.as_slice() < from)
                .filter(|(k, _)| k.as_slice() >= lower)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            entries.reverse();
            Ok(MockIter { entries, pos: 0 })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    fn cx() -> Context {
        Context::none()
    }

    fn drain(mut it: impl KvIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        while it.valid() {
            out.push((it.key().to_vec(), it.value().to_vec()));
            it.next().unwrap();
        }
        out
    }

    fn store_with(
        buffer_ops: &[(&[u8], Option<&[u8]>)],
        snap: &[(&[u8], &[u8])],
    ) -> UnionStore<MockSnapshot> {
        let buffer = MemBuffer::new();
        for (k, v) in buffer_ops {
            match v {
                Some(v) => buffer.set(k, v).unwrap(),
                None => buffer.delete(k).unwrap(),
            }
        }
        UnionStore::new(buffer, MockSnapshot::from_pairs(snap))
    }

    #[test]
    fn test_union_scenario() {
        // Snapshot {a,b,c}, buffer writes a and deletes b.
        let store = store_with(
            &[(b"a", Some(b"B")), (b"b", None)],
            &[(b"a", b"S"), (b"b", b"S"), (b"c", b"S")],
        );
        let got = drain(store.iter(&cx(), b"", b"").unwrap());
        assert_eq!(
            got,
            vec![(b"a".to_vec(), b"B".to_vec()), (b"c".to_vec(), b"S".to_vec())]
        );
    }

    #[test]
    fn test_union_reverse() {
        let store = store_with(
            &[(b"a", Some(b"B")), (b"b", None), (b"d", Some(b"B"))],
            &[(b"a", b"S"), (b"b", b"S"), (b"c", b"S")],
        );
        let got = drain(store.iter_reverse(&cx(), b"", b"").unwrap());
        assert_eq!(
            got,
            vec![
                (b"d".to_vec(), b"B".to_vec()),
                (b"c".to_vec(), b"S".to_vec()),
                (b"a".to_vec(), b"B".to_vec()),
            ]
        );
    }

    #[test]
    fn test_union_one_side_exhausted() {
        // Buffer-only tail and snapshot-only tail.
        let store = store_with(
            &[(b"x", Some(b"B")), (b"y", None)],
            &[(b"a", b"S")],
        );
        let got = drain(store.iter(&cx(), b"", b"").unwrap());
        assert_eq!(
            got,
            vec![(b"a".to_vec(), b"S".to_vec()), (b"x".to_vec(), b"B".to_vec())]
        );
    }

    #[test]
    fn test_union_get_paths() {
        let store = store_with(
            &[(b"own", Some(b"B")), (b"gone", None)],
            &[(b"remote", b"S"), (b"gone", b"S")],
        );
        assert_eq!(store.get(&cx(), b"own").unwrap(), b"B");
        assert_eq!(store.get(&cx(), b"remote").unwrap(), b"S");
        // The local tombstone hides the remote value.
        assert_eq!(store.get(&cx(), b"gone"), Err(MemBufError::NotExist));
        assert_eq!(store.get(&cx(), b"missing"), Err(MemBufError::NotExist));
    }

    #[test]
    fn test_union_batch_get() {
        let store = store_with(
            &[(b"own", Some(b"B")), (b"gone", None)],
            &[(b"remote", b"S"), (b"gone", b"S")],
        );
        let got = store
            .batch_get(
                &cx(),
                &[b"own".as_slice(), b"remote".as_slice(), b"gone".as_slice(), b"nope".as_slice()],
            )
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[b"own".as_slice()], b"B".to_vec());
        assert_eq!(got[b"remote".as_slice()], b"S".to_vec());
    }

    #[test]
    fn test_union_respects_bounds() {
        let store = store_with(
            &[(b"b", Some(b"B")), (b"e", Some(b"B"))],
            &[(b"a", b"S"), (b"c", b"S"), (b"f", b"S")],
        );
        let got = drain(store.iter(&cx(), b"b", b"f").unwrap());
        assert_eq!(
            got,
            vec![
                (b"b".to_vec(), b"B".to_vec()),
                (b"c".to_vec(), b"S".to_vec()),
                (b"e".to_vec(), b"B".to_vec()),
            ]
        );
    }

    #[test]
    fn test_presume_key_not_exists_roundtrip() {
        let store = store_with(&[], &[]);
        assert!(!store.has_presume_key_not_exists(b"k"));
        store
            .mem_buffer()
            .update_flags(b"k", &[FlagsOp::SetPresumeKeyNotExists]);
        assert!(store.has_presume_key_not_exists(b"k"));
        store.unmark_presume_key_not_exists(b"k");
        assert!(!store.has_presume_key_not_exists(b"k"));
    }

    #[test]
    fn test_union_iter_propagates_buffer_invalidation() {
        let store = store_with(&[(b"a", Some(b"B"))], &[(b"b", b"S")]);
        let mut it = store.iter(&cx(), b"", b"").unwrap();
        assert!(it.valid());
        // Mutating the buffer invalidates its side of the union.
        store.mem_buffer().set(b"z", b"late").unwrap();
        assert_eq!(it.next(), Err(MemBufError::IteratorInvalidated));
    }

    #[test]
    fn test_tombstone_only_buffer_yields_snapshot_rest() {
        let store = store_with(
            &[(b"a", None), (b"b", None)],
            &[(b"a", b"S"), (b"c", b"S")],
        );
        let got = drain(store.iter(&cx(), b"", b"").unwrap());
        assert_eq!(got, vec![(b"c".to_vec(), b"S".to_vec())]);
    }
}
