//! Failure capture at the loop-callback boundary
//!
//! Work run by the event loop on a test's behalf executes under [`guard`], so a
//! panic never unwinds through the loop. What was raised is stored in a
//! [`FailureSlot`] and surfaced later at the call site waiting on that work.
//! The slot holds a single failure: the first one recorded wins and later ones
//! are dropped.

use crate::error::{Error, Failure};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Run `f`, converting a panic into [`Failure::Panic`] with its original payload
pub fn guard<F, R>(f: F) -> Result<R, Failure>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(f)).map_err(Failure::Panic)
}

/// Shared single-failure slot
#[derive(Clone, Default)]
pub struct FailureSlot {
    inner: Arc<Mutex<Option<Error>>>,
}

impl FailureSlot {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `err` unless a failure is already held.
    ///
    /// Returns `true` if `err` was stored.
    pub fn record(&self, err: Error) -> bool {
        let mut slot = self.inner.lock();
        if let Some(existing) = slot.as_ref() {
            log::debug!("Dropping failure `{}`; already holding `{}`", err, existing);
            return false;
        }
        *slot = Some(err);
        true
    }

    /// Consume the stored failure
    pub fn take(&self) -> Option<Error> {
        self.inner.lock().take()
    }

    /// Whether a failure is waiting to be surfaced
    pub fn is_set(&self) -> bool {
        self.inner.lock().is_some()
    }
}

impl std::fmt::Debug for FailureSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureSlot")
            .field("set", &self.is_set())
            .finish()
    }
}
