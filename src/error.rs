//! Error types for the write buffer.
//!
//! Every error is a plain value comparable by kind; nothing is recovered
//! internally and nothing is logged here. Callers that want logging wrap
//! the buffer.

use thiserror::Error;

/// Result type alias using [`MemBufError`].
pub type Result<T> = std::result::Result<T, MemBufError>;

/// Unified error type for buffer operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemBufError {
    /// The key has no entry, or its latest entry is a deletion tombstone.
    #[error("not exist")]
    NotExist,

    /// `set` was called with an empty value. Deletions go through
    /// `delete`, which writes the tombstone internally.
    #[error("cannot set an empty value")]
    CannotSetEmptyValue,

    /// A single key+value pair exceeds the per-entry size limit.
    #[error("entry size too large, size: {size}, limit: {limit}")]
    EntryTooLarge {
        /// The configured per-entry limit in bytes.
        limit: u64,
        /// The size of the offending entry in bytes.
        size: u64,
    },

    /// The write would push the buffer past its total size limit.
    #[error("transaction too large, size: {size}, limit: {limit}")]
    TxnTooLarge {
        /// The configured total limit in bytes.
        limit: u64,
        /// The size the buffer would reach.
        size: u64,
    },

    /// The snapshot was used after the stage it pins was released or a
    /// revert crossed its pinned sequence number.
    #[error("invalid snapshot")]
    InvalidSnapshot,

    /// The iterator was used after a mutation bumped the index
    /// generation.
    #[error("iterator invalidated by a write to the buffer")]
    IteratorInvalidated,

    /// Release/cleanup targeted a staging handle that is not at the top
    /// of the stack.
    #[error("staging handle {handle} is not at the top of the stack (top: {top})")]
    StagingMisuse {
        /// The handle passed by the caller.
        handle: usize,
        /// The current top of the staging stack.
        top: usize,
    },

    /// The caller-provided cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,
}
