//! Node allocation with per-size free lists.
//!
//! Internal nodes live in one slab per layout; a discarded node's slot
//! goes onto the matching free list and is handed back zero-initialized
//! on the next allocation. Node256 is rare enough that it gets no free
//! list. Leaves are never reused within a buffer's lifetime; their key
//! bytes live in the byte arena.

use std::mem;

use crate::arena::{ArenaAddr, MemArena};
use crate::art::node::{InnerNode, Leaf, Node16, Node256, Node4, Node48, NodeKind, NodeRef};

pub(crate) struct ArtAllocator {
    n4: Vec<Node4>,
    n16: Vec<Node16>,
    n48: Vec<Node48>,
    n256: Vec<Node256>,
    leaves: Vec<Leaf>,
    free4: Vec<u32>,
    free16: Vec<u32>,
    free48: Vec<u32>,
    keys: MemArena,
}

impl ArtAllocator {
    pub(crate) fn new(init_block_size: usize) -> Self {
        ArtAllocator {
            n4: Vec::new(),
            n16: Vec::new(),
            n48: Vec::new(),
            n256: Vec::new(),
            leaves: Vec::new(),
            free4: Vec::with_capacity(16),
            free16: Vec::with_capacity(8),
            free48: Vec::with_capacity(4),
            keys: MemArena::new(init_block_size),
        }
    }

    pub(crate) fn alloc_node4(&mut self) -> NodeRef {
        let idx = match self.free4.pop() {
            Some(idx) => {
                self.n4[idx as usize] = Node4::new();
                idx
            }
            None => {
                self.n4.push(Node4::new());
                (self.n4.len() - 1) as u32
            }
        };
        NodeRef {
            kind: NodeKind::Node4,
            idx,
        }
    }

    pub(crate) fn alloc_node16(&mut self) -> NodeRef {
        let idx = match self.free16.pop() {
            Some(idx) => {
                self.n16[idx as usize] = Node16::new();
                idx
            }
            None => {
                self.n16.push(Node16::new());
                (self.n16.len() - 1) as u32
            }
        };
        NodeRef {
            kind: NodeKind::Node16,
            idx,
        }
    }

    pub(crate) fn alloc_node48(&mut self) -> NodeRef {
        let idx = match self.free48.pop() {
            Some(idx) => {
                self.n48[idx as usize] = Node48::new();
                idx
            }
            None => {
                self.n48.push(Node48::new());
                (self.n48.len() - 1) as u32
            }
        };
        NodeRef {
            kind: NodeKind::Node48,
            idx,
        }
    }

    pub(crate) fn alloc_node256(&mut self) -> NodeRef {
        self.n256.push(Node256::new());
        NodeRef {
            kind: NodeKind::Node256,
            idx: (self.n256.len() - 1) as u32,
        }
    }

    /// Returns a discarded internal node to its free list.
    pub(crate) fn free_node(&mut self, r: NodeRef) {
        match r.kind {
            NodeKind::Node4 => self.free4.push(r.idx),
            NodeKind::Node16 => self.free16.push(r.idx),
            NodeKind::Node48 => self.free48.push(r.idx),
            // Too rare to be worth tracking; the slab slot just stays.
            NodeKind::Node256 => {}
            NodeKind::Leaf => unreachable!("leaves are not freed"),
        }
    }

    /// Creates a leaf for `key`, copying the key into the byte arena.
    pub(crate) fn alloc_leaf(&mut self, key: &[u8]) -> NodeRef {
        let key_addr = if key.is_empty() {
            ArenaAddr::NULL
        } else {
            self.keys.alloc_bytes(key)
        };
        self.leaves.push(Leaf::new(key_addr, key.len()));
        NodeRef::leaf((self.leaves.len() - 1) as u32)
    }

    pub(crate) fn leaf(&self, idx: u32) -> &Leaf {
        &self.leaves[idx as usize]
    }

    pub(crate) fn leaf_mut(&mut self, idx: u32) -> &mut Leaf {
        &mut self.leaves[idx as usize]
    }

    /// The key bytes of leaf `idx`.
    pub(crate) fn leaf_key(&self, idx: u32) -> &[u8] {
        let leaf = self.leaves[idx as usize];
        if leaf.key_addr.is_null() {
            return &[];
        }
        self.keys.get(leaf.key_addr, leaf.key_len as usize)
    }

    /// Dynamic dispatch over the four internal layouts.
    pub(crate) fn inner(&self, r: NodeRef) -> &dyn InnerNode {
        debug_assert!(!r.is_null() && !r.is_leaf());
        match r.kind {
            NodeKind::Node4 => &self.n4[r.idx as usize],
            NodeKind::Node16 => &self.n16[r.idx as usize],
            NodeKind::Node48 => &self.n48[r.idx as usize],
            NodeKind::Node256 => &self.n256[r.idx as usize],
            NodeKind::Leaf => unreachable!("leaf handle passed to inner()"),
        }
    }

    pub(crate) fn inner_mut(&mut self, r: NodeRef) -> &mut dyn InnerNode {
        debug_assert!(!r.is_null() && !r.is_leaf());
        match r.kind {
            NodeKind::Node4 => &mut self.n4[r.idx as usize],
            NodeKind::Node16 => &mut self.n16[r.idx as usize],
            NodeKind::Node48 => &mut self.n48[r.idx as usize],
            NodeKind::Node256 => &mut self.n256[r.idx as usize],
            NodeKind::Leaf => unreachable!("leaf handle passed to inner_mut()"),
        }
    }

    /// Grows a full node to the next layout, carrying header and
    /// children over. The old node goes to its free list.
    pub(crate) fn grow(&mut self, r: NodeRef) -> NodeRef {
        let grown = match r.kind {
            NodeKind::Node4 => {
                let old = self.n4[r.idx as usize];
                let grown = self.alloc_node16();
                let n16 = &mut self.n16[grown.idx as usize];
                n16.header = old.header;
                n16.keys[..4].copy_from_slice(&old.keys);
                n16.children[..4].copy_from_slice(&old.children);
                grown
            }
            NodeKind::Node16 => {
                let old = self.n16[r.idx as usize];
                let grown = self.alloc_node48();
                let n48 = &mut self.n48[grown.idx as usize];
                n48.header = old.header;
                for slot in 0..old.header.num_children as usize {
                    n48.index[old.keys[slot] as usize] = (slot + 1) as u8;
                    n48.present |= 1 << slot;
                    n48.children[slot] = old.children[slot];
                }
                grown
            }
            NodeKind::Node48 => {
                let old = self.n48[r.idx as usize];
                let grown = self.alloc_node256();
                let n256 = &mut self.n256[grown.idx as usize];
                n256.header = old.header;
                for b in 0..256 {
                    let v = old.index[b];
                    if v != 0 {
                        n256.children[b] = old.children[(v - 1) as usize];
                    }
                }
                grown
            }
            NodeKind::Node256 | NodeKind::Leaf => unreachable!("cannot grow {:?}", r.kind),
        };
        self.free_node(r);
        grown
    }

    /// Shrinks a node to the previous layout after deletions brought it
    /// under the threshold.
    pub(crate) fn shrink(&mut self, r: NodeRef) -> NodeRef {
        let shrunk = match r.kind {
            NodeKind::Node16 => {
                let old = self.n16[r.idx as usize];
                let shrunk = self.alloc_node4();
                let n4 = &mut self.n4[shrunk.idx as usize];
                n4.header = old.header;
                let n = old.header.num_children as usize;
                n4.keys[..n].copy_from_slice(&old.keys[..n]);
                n4.children[..n].copy_from_slice(&old.children[..n]);
                shrunk
            }
            NodeKind::Node48 => {
                let old = self.n48[r.idx as usize];
                let shrunk = self.alloc_node16();
                let n16 = &mut self.n16[shrunk.idx as usize];
                n16.header = old.header;
                let mut slot = 0usize;
                for b in 0..256 {
                    let v = old.index[b];
                    if v != 0 {
                        n16.keys[slot] = b as u8;
                        n16.children[slot] = old.children[(v - 1) as usize];
                        slot += 1;
                    }
                }
                debug_assert_eq!(slot, old.header.num_children as usize);
                shrunk
            }
            NodeKind::Node256 => {
                let old = self.n256[r.idx as usize];
                let shrunk = self.alloc_node48();
                let n48 = &mut self.n48[shrunk.idx as usize];
                n48.header = old.header;
                let mut slot = 0usize;
                for b in 0..256 {
                    if !old.children[b].is_null() {
                        n48.index[b] = (slot + 1) as u8;
                        n48.present |= 1 << slot;
                        n48.children[slot] = old.children[b];
                        slot += 1;
                    }
                }
                debug_assert_eq!(slot, old.header.num_children as usize);
                shrunk
            }
            NodeKind::Node4 | NodeKind::Leaf => unreachable!("cannot shrink {:?}", r.kind),
        };
        self.free_node(r);
        shrunk
    }

    /// Bytes held by the slabs plus the key arena.
    pub(crate) fn memory_used(&self) -> usize {
        self.keys.capacity()
            + self.n4.capacity() * mem::size_of::<Node4>()
            + self.n16.capacity() * mem::size_of::<Node16>()
            + self.n48.capacity() * mem::size_of::<Node48>()
            + self.n256.capacity() * mem::size_of::<Node256>()
            + self.leaves.capacity() * mem::size_of::<Leaf>()
    }
}
