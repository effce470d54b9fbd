//! Per-key metadata flags.
//!
//! Flags are recorded on the leaf, outside the value log: they are not
//! staged and survive checkpoint reverts. Flag updates are expressed as
//! an ordered list of [`FlagsOp`] deltas applied left to right.

const FLAG_PRESUME_KEY_NOT_EXISTS: u16 = 1 << 0;
const FLAG_KEY_LOCKED: u16 = 1 << 1;
const FLAG_NEED_LOCKED: u16 = 1 << 2;
const FLAG_NEED_CHECK_EXISTS: u16 = 1 << 3;
const FLAG_NO_NEED_COMMIT: u16 = 1 << 4;
const FLAG_ASSERT_EXISTS: u16 = 1 << 5;
const FLAG_ASSERT_NOT_EXISTS: u16 = 1 << 6;
const FLAG_NEWLY_INSERTED: u16 = 1 << 7;

/// A small bitset of per-key transaction metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyFlags(u16);

impl KeyFlags {
    /// No flags set.
    pub const EMPTY: KeyFlags = KeyFlags(0);

    /// Returns true if no flag is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The transaction promised this key is absent; the promise needs
    /// lazy verification at commit time.
    pub fn has_presume_key_not_exists(self) -> bool {
        self.0 & FLAG_PRESUME_KEY_NOT_EXISTS != 0
    }

    /// The key is pessimistically locked.
    pub fn has_locked(self) -> bool {
        self.0 & FLAG_KEY_LOCKED != 0
    }

    /// The key needs to be locked before commit.
    pub fn has_need_locked(self) -> bool {
        self.0 & FLAG_NEED_LOCKED != 0
    }

    /// The key's existence must be checked remotely.
    pub fn has_need_check_exists(self) -> bool {
        self.0 & FLAG_NEED_CHECK_EXISTS != 0
    }

    /// The key carries no mutation worth committing.
    pub fn has_no_need_commit(self) -> bool {
        self.0 & FLAG_NO_NEED_COMMIT != 0
    }

    /// The key is asserted to exist.
    pub fn has_assert_exists(self) -> bool {
        self.0 & FLAG_ASSERT_EXISTS != 0
    }

    /// The key is asserted to not exist.
    pub fn has_assert_not_exists(self) -> bool {
        self.0 & FLAG_ASSERT_NOT_EXISTS != 0
    }

    /// The key was first written by this transaction.
    pub fn has_newly_inserted(self) -> bool {
        self.0 & FLAG_NEWLY_INSERTED != 0
    }
}

/// An additive or subtractive flag delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagsOp {
    /// Mark the key as presumed-not-exists.
    SetPresumeKeyNotExists,
    /// Clear the presumed-not-exists mark.
    DelPresumeKeyNotExists,
    /// Mark the key as locked.
    SetKeyLocked,
    /// Clear the locked mark.
    DelKeyLocked,
    /// Mark the key as needing a lock before commit.
    SetNeedLocked,
    /// Mark the key as needing a remote existence check.
    SetNeedCheckExists,
    /// Clear the remote existence check mark.
    DelNeedCheckExists,
    /// Mark the key as not needing to be committed.
    SetNoNeedCommit,
    /// Assert the key exists. Clears any not-exists assertion.
    SetAssertExists,
    /// Assert the key does not exist. Clears any exists assertion.
    SetAssertNotExists,
    /// Mark the key as newly inserted by this transaction.
    SetNewlyInserted,
}

/// Applies `ops` to `origin` in order and returns the result.
pub fn apply_flags_ops(origin: KeyFlags, ops: &[FlagsOp]) -> KeyFlags {
    let mut bits = origin.0;
    for op in ops {
        match op {
            FlagsOp::SetPresumeKeyNotExists => bits |= FLAG_PRESUME_KEY_NOT_EXISTS,
            FlagsOp::DelPresumeKeyNotExists => bits &= !FLAG_PRESUME_KEY_NOT_EXISTS,
            FlagsOp::SetKeyLocked => bits |= FLAG_KEY_LOCKED,
            FlagsOp::DelKeyLocked => bits &= !FLAG_KEY_LOCKED,
            FlagsOp::SetNeedLocked => bits |= FLAG_NEED_LOCKED,
            FlagsOp::SetNeedCheckExists => bits |= FLAG_NEED_CHECK_EXISTS,
            FlagsOp::DelNeedCheckExists => bits &= !FLAG_NEED_CHECK_EXISTS,
            FlagsOp::SetNoNeedCommit => bits |= FLAG_NO_NEED_COMMIT,
            FlagsOp::SetAssertExists => {
                bits |= FLAG_ASSERT_EXISTS;
                bits &= !FLAG_ASSERT_NOT_EXISTS;
            }
            FlagsOp::SetAssertNotExists => {
                bits |= FLAG_ASSERT_NOT_EXISTS;
                bits &= !FLAG_ASSERT_EXISTS;
            }
            FlagsOp::SetNewlyInserted => bits |= FLAG_NEWLY_INSERTED,
        }
    }
    KeyFlags(bits)
}
