//! Ordered leaf traversal.
//!
//! The cursor keeps a stack of `(node, slot)` frames. A node's in-place
//! leaf sorts before all of its children (its key is a strict prefix of
//! theirs), so forward traversal visits in-place first and reverse
//! traversal visits it last. The cursor stores handles, not borrows: it
//! stays cheap to keep around, and it is only valid while the index
//! generation is unchanged — the owning iterator checks that before
//! every advance.

use crate::art::node::{InnerNode, NodeRef};
use crate::art::Art;

#[derive(Debug, Clone, Copy)]
enum Slot {
    /// Visiting the node's in-place leaf.
    Inplace,
    /// Visiting the child at this layout slot.
    Child(u16),
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    node: NodeRef,
    slot: Slot,
}

pub(crate) struct ArtCursor {
    frames: Vec<Frame>,
    current: NodeRef,
    reverse: bool,
}

impl ArtCursor {
    /// Positions at the smallest leaf with key >= `lower` (everything
    /// when `lower` is empty).
    pub(crate) fn new_forward(art: &Art, lower: &[u8]) -> Self {
        let mut cursor = ArtCursor {
            frames: Vec::new(),
            current: NodeRef::NULL,
            reverse: false,
        };
        if lower.is_empty() {
            cursor.descend_min(art, art.root);
        } else {
            cursor.seek_forward(art, lower);
        }
        cursor
    }

    /// Positions at the largest leaf with key < `upper` (everything
    /// when `upper` is empty).
    pub(crate) fn new_reverse(art: &Art, upper: &[u8]) -> Self {
        let mut cursor = ArtCursor {
            frames: Vec::new(),
            current: NodeRef::NULL,
            reverse: true,
        };
        if upper.is_empty() {
            cursor.descend_max(art, art.root);
        } else {
            cursor.seek_reverse(art, upper);
        }
        cursor
    }

    /// Slab index of the current leaf, or `None` once exhausted.
    pub(crate) fn current_leaf(&self) -> Option<u32> {
        if self.current.is_null() {
            None
        } else {
            Some(self.current.idx)
        }
    }

    /// Moves to the next leaf in the cursor's direction.
    pub(crate) fn advance(&mut self, art: &Art) {
        if self.reverse {
            self.advance_reverse(art);
        } else {
            self.advance_forward(art);
        }
    }

    fn descend_min(&mut self, art: &Art, mut r: NodeRef) {
        if r.is_null() {
            self.current = NodeRef::NULL;
            return;
        }
        loop {
            if r.is_leaf() {
                self.current = r;
                return;
            }
            let node = art.alloc.inner(r);
            let inplace = node.header().inplace_leaf;
            if !inplace.is_null() {
                self.frames.push(Frame { node: r, slot: Slot::Inplace });
                self.current = inplace;
                return;
            }
            let slot = node.slot_at_or_after(0).expect("inner node with no children");
            let child = node.child_at(slot);
            self.frames.push(Frame { node: r, slot: Slot::Child(slot) });
            r = child;
        }
    }

    fn descend_max(&mut self, art: &Art, mut r: NodeRef) {
        if r.is_null() {
            self.current = NodeRef::NULL;
            return;
        }
        loop {
            if r.is_leaf() {
                self.current = r;
                return;
            }
            let node = art.alloc.inner(r);
            if let Some(slot) = node.slot_at_or_before(u16::MAX) {
                let child = node.child_at(slot);
                self.frames.push(Frame { node: r, slot: Slot::Child(slot) });
                r = child;
                continue;
            }
            let inplace = node.header().inplace_leaf;
            debug_assert!(!inplace.is_null(), "inner node with no children and no in-place leaf");
            self.frames.push(Frame { node: r, slot: Slot::Inplace });
            self.current = inplace;
            return;
        }
    }

    fn advance_forward(&mut self, art: &Art) {
        loop {
            let Some(frame) = self.frames.last().copied() else {
                self.current = NodeRef::NULL;
                return;
            };
            let node = art.alloc.inner(frame.node);
            let next = match frame.slot {
                Slot::Inplace => node.slot_at_or_after(0),
                Slot::Child(s) => node.slot_at_or_after(s + 1),
            };
            match next {
                Some(slot) => {
                    let child = node.child_at(slot);
                    self.frames.last_mut().unwrap().slot = Slot::Child(slot);
                    self.descend_min(art, child);
                    return;
                }
                None => {
                    self.frames.pop();
                }
            }
        }
    }

    fn advance_reverse(&mut self, art: &Art) {
        loop {
            let Some(frame) = self.frames.last().copied() else {
                self.current = NodeRef::NULL;
                return;
            };
            let node = art.alloc.inner(frame.node);
            match frame.slot {
                Slot::Inplace => {
                    self.frames.pop();
                }
                Slot::Child(s) => {
                    let prev = if s == 0 { None } else { node.slot_at_or_before(s - 1) };
                    match prev {
                        Some(slot) => {
                            let child = node.child_at(slot);
                            self.frames.last_mut().unwrap().slot = Slot::Child(slot);
                            self.descend_max(art, child);
                            return;
                        }
                        None => {
                            let inplace = node.header().inplace_leaf;
                            if !inplace.is_null() {
                                self.frames.last_mut().unwrap().slot = Slot::Inplace;
                                self.current = inplace;
                                return;
                            }
                            self.frames.pop();
                        }
                    }
                }
            }
        }
    }

    fn seek_forward(&mut self, art: &Art, lower: &[u8]) {
        let mut r = art.root;
        let mut depth = 0usize;
        loop {
            if r.is_null() {
                self.current = NodeRef::NULL;
                return;
            }
            if r.is_leaf() {
                if art.alloc.leaf_key(r.idx) >= lower {
                    self.current = r;
                } else {
                    self.advance_forward(art);
                }
                return;
            }
            let pl = art.alloc.inner(r).header().prefix_len as usize;
            if pl > 0 {
                match cmp_bound_vs_prefix(art, r, lower, depth) {
                    std::cmp::Ordering::Less => {
                        // Every key under r is greater than the bound.
                        self.descend_min(art, r);
                        return;
                    }
                    std::cmp::Ordering::Greater => {
                        // Every key under r is smaller than the bound.
                        self.advance_forward(art);
                        return;
                    }
                    std::cmp::Ordering::Equal => depth += pl,
                }
            }
            if depth == lower.len() {
                self.descend_min(art, r);
                return;
            }
            let b = lower[depth];
            let node = art.alloc.inner(r);
            if let Some(slot) = node.slot_of_byte(b) {
                let child = node.child_at(slot);
                self.frames.push(Frame { node: r, slot: Slot::Child(slot) });
                r = child;
                depth += 1;
                continue;
            }
            match node.slot_for_byte_at_or_after(b) {
                Some(slot) => {
                    let child = node.child_at(slot);
                    self.frames.push(Frame { node: r, slot: Slot::Child(slot) });
                    self.descend_min(art, child);
                    return;
                }
                None => {
                    // The in-place leaf (if any) is a prefix of the
                    // bound, hence smaller; nothing here qualifies.
                    self.advance_forward(art);
                    return;
                }
            }
        }
    }

    fn seek_reverse(&mut self, art: &Art, upper: &[u8]) {
        let mut r = art.root;
        let mut depth = 0usize;
        loop {
            if r.is_null() {
                self.current = NodeRef::NULL;
                return;
            }
            if r.is_leaf() {
                if art.alloc.leaf_key(r.idx) < upper {
                    self.current = r;
                } else {
                    self.advance_reverse(art);
                }
                return;
            }
            let pl = art.alloc.inner(r).header().prefix_len as usize;
            if pl > 0 {
                match cmp_bound_vs_prefix(art, r, upper, depth) {
                    std::cmp::Ordering::Less => {
                        // Bound sorts before everything under r.
                        self.advance_reverse(art);
                        return;
                    }
                    std::cmp::Ordering::Greater => {
                        self.descend_max(art, r);
                        return;
                    }
                    std::cmp::Ordering::Equal => depth += pl,
                }
            }
            if depth == upper.len() {
                // The bound equals the path here and the bound is
                // exclusive: nothing under r qualifies.
                self.advance_reverse(art);
                return;
            }
            let b = upper[depth];
            let node = art.alloc.inner(r);
            if let Some(slot) = node.slot_of_byte(b) {
                let child = node.child_at(slot);
                self.frames.push(Frame { node: r, slot: Slot::Child(slot) });
                r = child;
                depth += 1;
                continue;
            }
            let prev = if b == 0 { None } else { node.slot_for_byte_at_or_before(b - 1) };
            match prev {
                Some(slot) => {
                    let child = node.child_at(slot);
                    self.frames.push(Frame { node: r, slot: Slot::Child(slot) });
                    self.descend_max(art, child);
                    return;
                }
                None => {
                    let inplace = node.header().inplace_leaf;
                    if !inplace.is_null() {
                        self.frames.push(Frame { node: r, slot: Slot::Inplace });
                        self.current = inplace;
                        return;
                    }
                    self.advance_reverse(art);
                    return;
                }
            }
        }
    }
}

/// Compares `bound[depth..]` against the full prefix of `node`,
/// treating bound exhaustion inside the prefix as `Less`.
fn cmp_bound_vs_prefix(art: &Art, node: NodeRef, bound: &[u8], depth: usize) -> std::cmp::Ordering {
    let pl = art.alloc.inner(node).header().prefix_len as usize;
    let matched = art.prefix_matched_len(node, bound, depth);
    if matched == pl {
        return std::cmp::Ordering::Equal;
    }
    if depth + matched == bound.len() {
        return std::cmp::Ordering::Less;
    }
    let prefix_byte = prefix_byte_at(art, node, depth, matched);
    bound[depth + matched].cmp(&prefix_byte)
}

fn prefix_byte_at(art: &Art, node: NodeRef, depth: usize, i: usize) -> u8 {
    let header = art.alloc.inner(node).header();
    let stored = header.stored_prefix();
    if i < stored.len() {
        return stored[i];
    }
    let lk = art.alloc.leaf_key(art.min_leaf(node));
    lk[depth + i]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::INIT_BLOCK_SIZE;

    fn art_with(keys: &[&[u8]]) -> Art {
        let mut a = Art::new(INIT_BLOCK_SIZE);
        for k in keys {
            a.set(k, b"v", &[]).unwrap();
        }
        a
    }

    fn collect_forward(a: &Art, lower: &[u8]) -> Vec<Vec<u8>> {
        let mut cursor = ArtCursor::new_forward(a, lower);
        let mut out = Vec::new();
        while let Some(idx) = cursor.current_leaf() {
            out.push(a.alloc.leaf_key(idx).to_vec());
            cursor.advance(a);
        }
        out
    }

    fn collect_reverse(a: &Art, upper: &[u8]) -> Vec<Vec<u8>> {
        let mut cursor = ArtCursor::new_reverse(a, upper);
        let mut out = Vec::new();
        while let Some(idx) = cursor.current_leaf() {
            out.push(a.alloc.leaf_key(idx).to_vec());
            cursor.advance(a);
        }
        out
    }

    #[test]
    fn test_forward_order() {
        let a = art_with(&[b"banana", b"apple", b"cherry", b"app", b"applesauce"]);
        let keys = collect_forward(&a, b"");
        assert_eq!(
            keys,
            vec![
                b"app".to_vec(),
                b"apple".to_vec(),
                b"applesauce".to_vec(),
                b"banana".to_vec(),
                b"cherry".to_vec(),
            ]
        );
    }

    #[test]
    fn test_reverse_order() {
        let a = art_with(&[b"banana", b"apple", b"cherry", b"app"]);
        let keys = collect_reverse(&a, b"");
        assert_eq!(
            keys,
            vec![b"cherry".to_vec(), b"banana".to_vec(), b"apple".to_vec(), b"app".to_vec()]
        );
    }

    #[test]
    fn test_seek_forward_lands_on_or_after() {
        let a = art_with(&[b"a", b"c", b"e"]);
        assert_eq!(collect_forward(&a, b"b"), vec![b"c".to_vec(), b"e".to_vec()]);
        assert_eq!(collect_forward(&a, b"c"), vec![b"c".to_vec(), b"e".to_vec()]);
        assert_eq!(collect_forward(&a, b"f"), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn test_seek_reverse_is_exclusive() {
        let a = art_with(&[b"a", b"c", b"e"]);
        assert_eq!(collect_reverse(&a, b"c"), vec![b"a".to_vec()]);
        assert_eq!(collect_reverse(&a, b"d"), vec![b"c".to_vec(), b"a".to_vec()]);
        assert_eq!(collect_reverse(&a, b"a"), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn test_seek_inside_long_prefix() {
        let a = art_with(&[
            b"organization/department/team/alpha",
            b"organization/department/team/beta",
            b"organization/other",
        ]);
        // Bound diverging inside the compressed prefix, below it.
        assert_eq!(collect_forward(&a, b"organization/dep").len(), 3);
        // Bound diverging inside the compressed prefix, above it.
        assert_eq!(collect_forward(&a, b"organization/dez").len(), 1);
        assert_eq!(
            collect_forward(&a, b"organization/department/team/b"),
            vec![b"organization/department/team/beta".to_vec(), b"organization/other".to_vec()]
        );
        assert_eq!(collect_reverse(&a, b"organization/dep").len(), 0);
        assert_eq!(collect_reverse(&a, b"organization/dez").len(), 2);
    }

    #[test]
    fn test_inplace_leaf_ordering_both_directions() {
        let a = art_with(&[b"k", b"k1", b"k2"]);
        assert_eq!(
            collect_forward(&a, b""),
            vec![b"k".to_vec(), b"k1".to_vec(), b"k2".to_vec()]
        );
        assert_eq!(
            collect_reverse(&a, b""),
            vec![b"k2".to_vec(), b"k1".to_vec(), b"k".to_vec()]
        );
        // Seeking at the in-place key.
        assert_eq!(collect_forward(&a, b"k").len(), 3);
        assert_eq!(collect_reverse(&a, b"k1"), vec![b"k".to_vec()]);
    }

    #[test]
    fn test_empty_tree() {
        let a = Art::new(INIT_BLOCK_SIZE);
        assert!(collect_forward(&a, b"").is_empty());
        assert!(collect_reverse(&a, b"").is_empty());
    }

    #[test]
    fn test_dense_fanout_scan() {
        let mut a = Art::new(INIT_BLOCK_SIZE);
        let mut expect = Vec::new();
        for b in (0..=255u8).rev() {
            a.set(&[b], &[b], &[]).unwrap();
            expect.push(vec![b]);
        }
        expect.sort();
        assert_eq!(collect_forward(&a, b""), expect);
        expect.reverse();
        assert_eq!(collect_reverse(&a, b""), expect);
    }
}
