//! Cancellation signals for read paths.
//!
//! Reads accept an opaque [`Context`] and check it at coarse boundaries:
//! before acquiring the buffer lock, per key in batched gets, and before
//! each snapshot batch. The signal never propagates into the arena or the
//! index itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{MemBufError, Result};

/// An opaque cancellation signal: an optional shared flag plus an
/// optional deadline. The default context never fires.
#[derive(Clone, Default)]
pub struct Context {
    cancelled: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that never cancels.
    pub fn none() -> Self {
        Self::default()
    }

    /// A context driven by a shared flag; setting the flag to `true`
    /// cancels all operations using this context.
    pub fn with_cancel_flag(flag: Arc<AtomicBool>) -> Self {
        Self {
            cancelled: Some(flag),
            deadline: None,
        }
    }

    /// A context that cancels once `deadline` has passed.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancelled: None,
            deadline: Some(deadline),
        }
    }

    /// Returns true if the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        if let Some(flag) = &self.cancelled {
            if flag.load(Ordering::Relaxed) {
                return true;
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        false
    }

    /// Errors with [`MemBufError::Cancelled`] if the signal has fired.
    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(MemBufError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancellable", &self.cancelled.is_some())
            .field("deadline", &self.deadline)
            .finish()
    }
}
