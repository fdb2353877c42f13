//! Event loop interface consumed by the harness
//!
//! The harness only needs a small surface from the loop it drives: run until
//! stopped, queue callbacks, and schedule cancelable timeouts. [`IoLoop`] is a
//! cooperative single-threaded implementation of that surface.

pub mod io_loop;
mod timers;

pub use io_loop::{IoLoop, LoopStats};

use crate::error::{Failure, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Work queued on the loop
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Receives failures raised by callbacks the loop executes
pub type FailureHandler = Arc<dyn Fn(Failure) + Send + Sync + 'static>;

// About thirty years; stands in for deadlines past what `Instant` can hold
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// The instant `delay` after `now`, saturating instead of overflowing.
///
/// Delays too large for `Instant` map to a deadline far enough out that it
/// never fires during a test.
pub fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Cancelable handle for a scheduled timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeoutHandle(u64);

impl TimeoutHandle {
    /// Allocate a handle that is unique for the life of the process
    pub fn next() -> Self {
        static HANDLE_COUNTER: AtomicU64 = AtomicU64::new(0);
        TimeoutHandle(HANDLE_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id, for logging
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A cooperative event loop
pub trait EventLoop: Send + Sync {
    /// Run callbacks and timers until [`EventLoop::stop`] is called.
    ///
    /// A stop requested while the loop is idle makes the next `run` return
    /// immediately.
    fn run(&self) -> Result<()>;

    /// Ask the loop to return from `run` before executing its next callback
    fn stop(&self);

    /// Queue `callback` for the next loop tick
    fn add_callback(&self, callback: Callback);

    /// Run `callback` once `deadline` has passed
    fn add_timeout(&self, deadline: Instant, callback: Callback) -> TimeoutHandle;

    /// Cancel a timeout; returns `false` if it already fired or was removed
    fn remove_timeout(&self, handle: TimeoutHandle) -> bool;

    /// The loop's clock
    fn time(&self) -> Instant;

    /// Install or clear the handler for failures raised by callbacks
    fn set_failure_handler(&self, handler: Option<FailureHandler>);

    /// Whether `run` is currently executing
    fn is_running(&self) -> bool;

    /// Discard every pending callback and timeout
    fn close(&self);

    /// Schedule `callback` after `delay` from now
    fn call_later(&self, delay: Duration, callback: Callback) -> TimeoutHandle {
        self.add_timeout(deadline_after(self.time(), delay), callback)
    }
}
