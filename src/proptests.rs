//! Model-based property tests: every action runs against both the
//! buffer and a BTreeMap model (with a stack of saved states standing
//! in for the staging stack), and observable state is compared after
//! each step.

use std::collections::BTreeMap;

use proptest::prelude::*;
use proptest_derive::Arbitrary;

use crate::union::test_util::MockSnapshot;
use crate::{Context, KvIterator, MemBufError, MemBuffer, UnionStore};

/// Key generator biased toward shared prefixes and delimiters, the
/// shapes that exercise prefix compression and node growth.
#[derive(Debug, Clone)]
struct Key(Vec<u8>);

impl Arbitrary for Key {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        prop_oneof![
            Just(Key(Vec::new())),
            prop::collection::vec(any::<u8>(), 1..4).prop_map(Key),
            prop::collection::vec(any::<u8>(), 4..40).prop_map(Key),
            "[a-d]{1,6}/[a-d]{0,6}".prop_map(|s| Key(s.into_bytes())),
            "[a-d]{1,4}".prop_map(|s| {
                let mut key = s.into_bytes();
                key.extend_from_slice(b"shared/long/common/prefix");
                Key(key)
            }),
        ]
        .boxed()
    }
}

/// Non-empty value (the public `set` rejects empty values).
#[derive(Debug, Clone)]
struct Value(Vec<u8>);

impl Arbitrary for Value {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        prop::collection::vec(any::<u8>(), 1..12).prop_map(Value).boxed()
    }
}

#[derive(Arbitrary, Debug, Clone)]
enum Action {
    Set(Key, Value),
    Delete(Key),
    Get(Key),
    Staging,
    Release,
    Cleanup,
    Scan,
}

/// Buffered state per key: `None` is a tombstone.
type Entries = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

#[derive(Default)]
struct Test {
    buffer: MemBuffer,
    entries: Entries,
    saved: Vec<Entries>,
}

impl Test {
    fn execute(&mut self, action: Action) {
        let cx = Context::none();
        match action {
            Action::Set(k, v) => {
                self.buffer.set(&k.0, &v.0).unwrap();
                self.entries.insert(k.0, Some(v.0));
            }
            Action::Delete(k) => {
                self.buffer.delete(&k.0).unwrap();
                self.entries.insert(k.0, None);
            }
            Action::Get(k) => {
                let got = self.buffer.get(&cx, &k.0);
                match self.entries.get(&k.0) {
                    Some(Some(v)) => assert_eq!(got.as_deref(), Ok(v.as_slice())),
                    _ => assert_eq!(got, Err(MemBufError::NotExist)),
                }
            }
            Action::Staging => {
                let handle = self.buffer.staging();
                assert_eq!(handle, self.saved.len() + 1);
                self.saved.push(self.entries.clone());
            }
            Action::Release => {
                if !self.saved.is_empty() {
                    self.buffer.release(self.saved.len()).unwrap();
                    self.saved.pop();
                }
            }
            Action::Cleanup => {
                if let Some(saved) = self.saved.pop() {
                    self.buffer.cleanup(self.saved.len() + 1).unwrap();
                    self.entries = saved;
                }
            }
            Action::Scan => self.check_scan(),
        }
        assert_eq!(self.buffer.len(), self.entries.len(), "entry count diverged");
    }

    fn check_scan(&self) {
        let cx = Context::none();
        let visible: Vec<(Vec<u8>, Vec<u8>)> = self
            .entries
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), v.clone())))
            .collect();

        let mut got = Vec::new();
        let mut it = self.buffer.iter(&cx, b"", b"").unwrap();
        while it.valid() {
            got.push((it.key().to_vec(), it.value().to_vec()));
            it.next().unwrap();
        }
        assert_eq!(got, visible, "forward scan diverged");

        let mut got_rev = Vec::new();
        let mut it = self.buffer.iter_reverse(&cx, b"", b"").unwrap();
        while it.valid() {
            got_rev.push((it.key().to_vec(), it.value().to_vec()));
            it.next().unwrap();
        }
        let mut expect_rev = visible;
        expect_rev.reverse();
        assert_eq!(got_rev, expect_rev, "reverse scan diverged");
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        failure_persistence: None,
        ..ProptestConfig::default()
    })]

    #[test]
    fn proptest_buffer_vs_btreemap(actions in prop::collection::vec(any::<Action>(), 1..80)) {
        let mut test = Test::default();
        for action in actions {
            test.execute(action);
        }
        test.check_scan();
    }

    #[test]
    fn proptest_checkpoint_roundtrip(
        before in prop::collection::vec(any::<(Key, Option<Value>)>(), 0..30),
        after in prop::collection::vec(any::<(Key, Option<Value>)>(), 1..30),
    ) {
        let mut test = Test::default();
        for (k, v) in before {
            match v {
                Some(v) => test.execute(Action::Set(k, v)),
                None => test.execute(Action::Delete(k)),
            }
        }
        let token = test.buffer.checkpoint();
        let saved = test.entries.clone();

        for (k, v) in after {
            match v {
                Some(v) => test.execute(Action::Set(k, v)),
                None => test.execute(Action::Delete(k)),
            }
        }
        test.buffer.revert_to_checkpoint(&token);
        test.entries = saved;
        test.check_scan();
        prop_assert_eq!(test.buffer.checkpoint(), token);
    }

    #[test]
    fn proptest_union_matches_overlayed_model(
        snapshot in prop::collection::btree_map(any::<Key>().prop_map(|k| k.0), prop::collection::vec(any::<u8>(), 1..8), 0..20),
        writes in prop::collection::vec(any::<(Key, Option<Value>)>(), 0..30),
        reverse in any::<bool>(),
    ) {
        let cx = Context::none();
        let buffer = MemBuffer::new();
        let mut overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        for (k, v) in writes {
            match v {
                Some(v) => {
                    buffer.set(&k.0, &v.0).unwrap();
                    overlay.insert(k.0, Some(v.0));
                }
                None => {
                    buffer.delete(&k.0).unwrap();
                    overlay.insert(k.0, None);
                }
            }
        }

        // Expected union: snapshot overlaid with the buffer, tombstones
        // removed.
        let mut expect: BTreeMap<Vec<u8>, Vec<u8>> = snapshot.clone();
        for (k, v) in &overlay {
            match v {
                Some(v) => {
                    expect.insert(k.clone(), v.clone());
                }
                None => {
                    expect.remove(k);
                }
            }
        }
        let mut expect: Vec<(Vec<u8>, Vec<u8>)> = expect.into_iter().collect();
        if reverse {
            expect.reverse();
        }

        let store = UnionStore::new(buffer, MockSnapshot { map: snapshot });
        let mut got = Vec::new();
        let mut it = if reverse {
            store.iter_reverse(&cx, b"", b"").unwrap()
        } else {
            store.iter(&cx, b"", b"").unwrap()
        };
        while it.valid() {
            got.push((it.key().to_vec(), it.value().to_vec()));
            it.next().unwrap();
        }
        prop_assert_eq!(got, expect);
    }
}
