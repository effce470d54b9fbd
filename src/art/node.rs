//! ART node variants with adaptive sizing.
//!
//! Four internal layouts, picked by fanout:
//!
//! - Node4: up to 4 children, parallel sorted key/child arrays
//! - Node16: up to 16 children, sorted keys with binary search
//! - Node48: 256-byte index (byte -> slot+1, 0 = absent) + 48 children
//! - Node256: direct 256-slot child array
//!
//! Nodes are plain structs living in per-kind slabs; children are
//! referenced by [`NodeRef`] handles (kind + slab index), never by
//! pointer. Shared header fields live in an embedded [`NodeHeader`] and
//! are reached through the [`InnerNode`] capability trait.

use crate::arena::ArenaAddr;
use crate::arena::vlog::NULL_OFFSET;
use crate::flags::KeyFlags;

/// In-node prefix cap. Longer prefixes keep their true length in the
/// header and reconstruct the overflow bytes from a descendant leaf.
pub(crate) const MAX_PREFIX_LEN: usize = 20;

/// The kind half of a node handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Node4,
    Node16,
    Node48,
    Node256,
    Leaf,
}

/// A typed index into the node slabs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeRef {
    pub kind: NodeKind,
    pub idx: u32,
}

impl NodeRef {
    pub(crate) const NULL: NodeRef = NodeRef {
        kind: NodeKind::Leaf,
        idx: u32::MAX,
    };

    pub(crate) fn leaf(idx: u32) -> Self {
        NodeRef {
            kind: NodeKind::Leaf,
            idx,
        }
    }

    pub(crate) fn is_null(self) -> bool {
        self.idx == u32::MAX
    }

    pub(crate) fn is_leaf(self) -> bool {
        !self.is_null() && self.kind == NodeKind::Leaf
    }
}

/// Header embedded in every internal node.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeHeader {
    /// Number of child slots in use (the in-place leaf not included).
    pub num_children: u16,
    /// Full prefix length; may exceed [`MAX_PREFIX_LEN`].
    pub prefix_len: u32,
    /// The first `min(prefix_len, MAX_PREFIX_LEN)` prefix bytes.
    pub prefix: [u8; MAX_PREFIX_LEN],
    /// Leaf whose key ends exactly at this node, or NULL. Ordered before
    /// every child: its key is a strict prefix of theirs.
    pub inplace_leaf: NodeRef,
}

impl NodeHeader {
    fn new() -> Self {
        NodeHeader {
            num_children: 0,
            prefix_len: 0,
            prefix: [0; MAX_PREFIX_LEN],
            inplace_leaf: NodeRef::NULL,
        }
    }

    /// The prefix bytes stored in the node (truncated at the cap).
    pub(crate) fn stored_prefix(&self) -> &[u8] {
        let n = (self.prefix_len as usize).min(MAX_PREFIX_LEN);
        &self.prefix[..n]
    }

    /// Installs `prefix` as the stored prefix of a `full_len`-byte edge.
    pub(crate) fn set_prefix(&mut self, prefix: &[u8], full_len: usize) {
        debug_assert!(prefix.len() >= full_len.min(MAX_PREFIX_LEN));
        self.prefix_len = full_len as u32;
        let n = full_len.min(MAX_PREFIX_LEN);
        self.prefix[..n].copy_from_slice(&prefix[..n]);
    }
}

/// A terminal node binding a key to its value-log chain and flags.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Leaf {
    pub key_addr: ArenaAddr,
    pub key_len: u32,
    pub flags: KeyFlags,
    /// Offset of the newest value record, or `NULL_OFFSET` for a
    /// flags-only leaf.
    pub vlog_head: u64,
}

impl Leaf {
    pub(crate) fn new(key_addr: ArenaAddr, key_len: usize) -> Self {
        Leaf {
            key_addr,
            key_len: key_len as u32,
            flags: KeyFlags::EMPTY,
            vlog_head: NULL_OFFSET,
        }
    }

    pub(crate) fn has_value(&self) -> bool {
        self.vlog_head != NULL_OFFSET
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Node4 {
    pub header: NodeHeader,
    pub keys: [u8; 4],
    pub children: [NodeRef; 4],
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Node16 {
    pub header: NodeHeader,
    pub keys: [u8; 16],
    pub children: [NodeRef; 16],
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Node48 {
    pub header: NodeHeader,
    /// byte -> slot+1; 0 means absent.
    pub index: [u8; 256],
    /// Bitmap of used child slots, for O(1) slot allocation.
    pub present: u64,
    pub children: [NodeRef; 48],
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Node256 {
    pub header: NodeHeader,
    pub children: [NodeRef; 256],
}

impl Node4 {
    pub(crate) fn new() -> Self {
        Node4 {
            header: NodeHeader::new(),
            keys: [0; 4],
            children: [NodeRef::NULL; 4],
        }
    }
}

impl Node16 {
    pub(crate) fn new() -> Self {
        Node16 {
            header: NodeHeader::new(),
            keys: [0; 16],
            children: [NodeRef::NULL; 16],
        }
    }
}

impl Node48 {
    pub(crate) fn new() -> Self {
        Node48 {
            header: NodeHeader::new(),
            index: [0; 256],
            present: 0,
            children: [NodeRef::NULL; 48],
        }
    }
}

impl Node256 {
    pub(crate) fn new() -> Self {
        Node256 {
            header: NodeHeader::new(),
            children: [NodeRef::NULL; 256],
        }
    }
}

/// Capability trait over the four internal layouts.
///
/// Slot numbering is layout-specific: for Node4/Node16 a slot is an
/// index into the sorted key array, for Node48/Node256 it is the key
/// byte itself. Slots therefore enumerate children in key order for
/// every layout, which is what the cursor relies on.
pub(crate) trait InnerNode {
    fn header(&self) -> &NodeHeader;
    fn header_mut(&mut self) -> &mut NodeHeader;

    /// Maximum child count of this layout.
    fn capacity(&self) -> usize;

    /// Child count below which the node shrinks to the previous layout.
    /// Zero for Node4 (which collapses instead).
    fn shrink_threshold(&self) -> usize;

    /// The child following edge byte `b`, or NULL.
    fn find_child(&self, b: u8) -> NodeRef;

    /// Adds a child under `b`. The node must not be full and must not
    /// already have a child under `b`.
    fn add_child(&mut self, b: u8, child: NodeRef);

    /// Replaces the child under `b`. The child must exist.
    fn replace_child(&mut self, b: u8, child: NodeRef);

    /// Removes the child under `b`. The child must exist.
    fn remove_child(&mut self, b: u8);

    /// Smallest slot at or after `slot`, if any.
    fn slot_at_or_after(&self, slot: u16) -> Option<u16>;

    /// Largest slot at or before `slot`, if any.
    fn slot_at_or_before(&self, slot: u16) -> Option<u16>;

    /// Smallest slot whose key byte is >= `b`.
    fn slot_for_byte_at_or_after(&self, b: u8) -> Option<u16>;

    /// Largest slot whose key byte is <= `b`.
    fn slot_for_byte_at_or_before(&self, b: u8) -> Option<u16>;

    /// Slot of the child under exactly `b`.
    fn slot_of_byte(&self, b: u8) -> Option<u16>;

    fn child_at(&self, slot: u16) -> NodeRef;

    /// Key byte of the child at `slot`.
    fn byte_at(&self, slot: u16) -> u8;

    fn is_full(&self) -> bool {
        self.header().num_children as usize == self.capacity()
    }
}

macro_rules! sorted_array_inner {
    ($ty:ty, $cap:expr, $shrink:expr) => {
        impl InnerNode for $ty {
            fn header(&self) -> &NodeHeader {
                &self.header
            }

            fn header_mut(&mut self) -> &mut NodeHeader {
                &mut self.header
            }

            fn capacity(&self) -> usize {
                $cap
            }

            fn shrink_threshold(&self) -> usize {
                $shrink
            }

            fn find_child(&self, b: u8) -> NodeRef {
                match self.slot_of_byte(b) {
                    Some(slot) => self.children[slot as usize],
                    None => NodeRef::NULL,
                }
            }

            fn add_child(&mut self, b: u8, child: NodeRef) {
                let n = self.header.num_children as usize;
                debug_assert!(n < $cap);
                let pos = self.keys[..n].partition_point(|&k| k < b);
                debug_assert!(pos == n || self.keys[pos] != b);
                for i in (pos..n).rev() {
                    self.keys[i + 1] = self.keys[i];
                    self.children[i + 1] = self.children[i];
                }
                self.keys[pos] = b;
                self.children[pos] = child;
                self.header.num_children += 1;
            }

            fn replace_child(&mut self, b: u8, child: NodeRef) {
                let slot = self.slot_of_byte(b).expect("replacing a missing child");
                self.children[slot as usize] = child;
            }

            fn remove_child(&mut self, b: u8) {
                let n = self.header.num_children as usize;
                let pos = self.slot_of_byte(b).expect("removing a missing child") as usize;
                for i in pos..n - 1 {
                    self.keys[i] = self.keys[i + 1];
                    self.children[i] = self.children[i + 1];
                }
                self.children[n - 1] = NodeRef::NULL;
                self.header.num_children -= 1;
            }

            fn slot_at_or_after(&self, slot: u16) -> Option<u16> {
                if slot < self.header.num_children {
                    Some(slot)
                } else {
                    None
                }
            }

            fn slot_at_or_before(&self, slot: u16) -> Option<u16> {
                let n = self.header.num_children;
                if n == 0 {
                    None
                } else {
                    Some(slot.min(n - 1))
                }
            }

            fn slot_for_byte_at_or_after(&self, b: u8) -> Option<u16> {
                let n = self.header.num_children as usize;
                let pos = self.keys[..n].partition_point(|&k| k < b);
                if pos < n {
                    Some(pos as u16)
                } else {
                    None
                }
            }

            fn slot_for_byte_at_or_before(&self, b: u8) -> Option<u16> {
                let n = self.header.num_children as usize;
                let pos = self.keys[..n].partition_point(|&k| k <= b);
                if pos > 0 {
                    Some((pos - 1) as u16)
                } else {
                    None
                }
            }

            fn slot_of_byte(&self, b: u8) -> Option<u16> {
                let n = self.header.num_children as usize;
                // Node4 is small enough that the partition_point binary
                // search degenerates to a couple of compares anyway.
                let pos = self.keys[..n].partition_point(|&k| k < b);
                if pos < n && self.keys[pos] == b {
                    Some(pos as u16)
                } else {
                    None
                }
            }

            fn child_at(&self, slot: u16) -> NodeRef {
                self.children[slot as usize]
            }

            fn byte_at(&self, slot: u16) -> u8 {
                self.keys[slot as usize]
            }
        }
    };
}

sorted_array_inner!(Node4, 4, 0);
sorted_array_inner!(Node16, 16, 4);

impl InnerNode for Node48 {
    fn header(&self) -> &NodeHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut NodeHeader {
        &mut self.header
    }

    fn capacity(&self) -> usize {
        48
    }

    fn shrink_threshold(&self) -> usize {
        16
    }

    fn find_child(&self, b: u8) -> NodeRef {
        let v = self.index[b as usize];
        if v == 0 {
            NodeRef::NULL
        } else {
            self.children[(v - 1) as usize]
        }
    }

    fn add_child(&mut self, b: u8, child: NodeRef) {
        debug_assert_eq!(self.index[b as usize], 0);
        let slot = (!self.present).trailing_zeros() as usize;
        debug_assert!(slot < 48);
        self.present |= 1 << slot;
        self.children[slot] = child;
        self.index[b as usize] = (slot + 1) as u8;
        self.header.num_children += 1;
    }

    fn replace_child(&mut self, b: u8, child: NodeRef) {
        let v = self.index[b as usize];
        debug_assert!(v != 0, "replacing a missing child");
        self.children[(v - 1) as usize] = child;
    }

    fn remove_child(&mut self, b: u8) {
        let v = self.index[b as usize];
        debug_assert!(v != 0, "removing a missing child");
        let slot = (v - 1) as usize;
        self.present &= !(1 << slot);
        self.children[slot] = NodeRef::NULL;
        self.index[b as usize] = 0;
        self.header.num_children -= 1;
    }

    fn slot_at_or_after(&self, slot: u16) -> Option<u16> {
        (slot..256).find(|&b| self.index[b as usize] != 0)
    }

    fn slot_at_or_before(&self, slot: u16) -> Option<u16> {
        (0..=slot.min(255)).rev().find(|&b| self.index[b as usize] != 0)
    }

    fn slot_for_byte_at_or_after(&self, b: u8) -> Option<u16> {
        self.slot_at_or_after(b as u16)
    }

    fn slot_for_byte_at_or_before(&self, b: u8) -> Option<u16> {
        self.slot_at_or_before(b as u16)
    }

    fn slot_of_byte(&self, b: u8) -> Option<u16> {
        if self.index[b as usize] != 0 {
            Some(b as u16)
        } else {
            None
        }
    }

    fn child_at(&self, slot: u16) -> NodeRef {
        let v = self.index[slot as usize];
        debug_assert!(v != 0);
        self.children[(v - 1) as usize]
    }

    fn byte_at(&self, slot: u16) -> u8 {
        slot as u8
    }
}

impl InnerNode for Node256 {
    fn header(&self) -> &NodeHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut NodeHeader {
        &mut self.header
    }

    fn capacity(&self) -> usize {
        256
    }

    fn shrink_threshold(&self) -> usize {
        48
    }

    fn find_child(&self, b: u8) -> NodeRef {
        self.children[b as usize]
    }

    fn add_child(&mut self, b: u8, child: NodeRef) {
        debug_assert!(self.children[b as usize].is_null());
        self.children[b as usize] = child;
        self.header.num_children += 1;
    }

    fn replace_child(&mut self, b: u8, child: NodeRef) {
        debug_assert!(!self.children[b as usize].is_null());
        self.children[b as usize] = child;
    }

    fn remove_child(&mut self, b: u8) {
        debug_assert!(!self.children[b as usize].is_null());
        self.children[b as usize] = NodeRef::NULL;
        self.header.num_children -= 1;
    }

    fn slot_at_or_after(&self, slot: u16) -> Option<u16> {
        (slot..256).find(|&b| !self.children[b as usize].is_null())
    }

    fn slot_at_or_before(&self, slot: u16) -> Option<u16> {
        (0..=slot.min(255)).rev().find(|&b| !self.children[b as usize].is_null())
    }

    fn slot_for_byte_at_or_after(&self, b: u8) -> Option<u16> {
        self.slot_at_or_after(b as u16)
    }

    fn slot_for_byte_at_or_before(&self, b: u8) -> Option<u16> {
        self.slot_at_or_before(b as u16)
    }

    fn slot_of_byte(&self, b: u8) -> Option<u16> {
        if self.children[b as usize].is_null() {
            None
        } else {
            Some(b as u16)
        }
    }

    fn child_at(&self, slot: u16) -> NodeRef {
        self.children[slot as usize]
    }

    fn byte_at(&self, slot: u16) -> u8 {
        slot as u8
    }
}
