//! # membuf — in-memory transactional write buffer
//!
//! The write side of a distributed transactional key-value client: all
//! writes of a transaction are staged in a [`MemBuffer`], reads union
//! the buffer with a remote read-only snapshot, and the buffer is
//! drained to the cluster at commit.
//!
//! ## Features
//!
//! - **Ordered index**: an adaptive radix tree (Node4/16/48/256, path
//!   compression with lazy expansion) over arena-backed leaves
//! - **Staged mutations**: nested LIFO checkpoints with O(1) rollback
//!   through a per-buffer value log
//! - **Stable snapshots**: read views pinned to the staging base,
//!   validated by sequence number, tolerant of concurrent writers
//! - **Union iteration**: own-writes-visible, latest-write-wins merge
//!   with a remote snapshot, tombstone-aware
//!
//! ## Example
//!
//! ```rust
//! use membuf::{Context, MemBuffer, MemBufError};
//!
//! let buf = MemBuffer::new();
//! let cx = Context::none();
//!
//! buf.set(b"k", b"v1").unwrap();
//! let h = buf.staging();
//! buf.set(b"k", b"v2").unwrap();
//! assert_eq!(buf.get(&cx, b"k").unwrap(), b"v2");
//! buf.cleanup(h).unwrap();
//! assert_eq!(buf.get(&cx, b"k").unwrap(), b"v1");
//!
//! buf.delete(b"k").unwrap();
//! assert_eq!(buf.get(&cx, b"k"), Err(MemBufError::NotExist));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod arena;
mod art;
mod buffer;
mod context;
mod error;
mod flags;
mod snapshot;
mod union;

#[cfg(test)]
mod proptests;

pub use art::{Checkpoint, UNLIMITED_SIZE};
pub use buffer::{BufferIter, BufferReadGuard, MemBuffer, Options};
pub use context::Context;
pub use error::{MemBufError, Result};
pub use flags::{apply_flags_ops, FlagsOp, KeyFlags};
pub use snapshot::{BatchedSnapshotIter, MemBufferSnapshot};
pub use union::{KvIterator, RemoteSnapshot, UnionIter, UnionStore};

/// Crate version, for collaborators that report it.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
