//! Driving coroutine-style test bodies on the event loop
//!
//! A test body is a future whose `.await` points are the suspension points the
//! loop resolves. [`CoroutineDriver::run`] polls it once synchronously; a body
//! that never suspends completes without the loop being entered. Otherwise the
//! driver arms a deadline and runs the loop, and every waker notification
//! schedules a loop callback that hands control back to the driver to re-poll.

use crate::bridge::RunContext;
use crate::capture;
use crate::error::{Error, Failure, Result};
use crate::event_loop::{deadline_after, EventLoop, TimeoutHandle};
use futures::task::{waker, ArcWake};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Values a test body may finish with
pub trait TestOutcome {
    /// Convert into the harness's failure representation
    fn into_outcome(self) -> std::result::Result<(), Failure>;
}

impl TestOutcome for () {
    fn into_outcome(self) -> std::result::Result<(), Failure> {
        Ok(())
    }
}

impl<E> TestOutcome for std::result::Result<(), E>
where
    E: std::error::Error + Send + 'static,
{
    fn into_outcome(self) -> std::result::Result<(), Failure> {
        self.map_err(Failure::from_error)
    }
}

/// Terminal state of a driven body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// The body returned normally
    Completed,
    /// The body, or a loop callback, failed
    Failed,
    /// The deadline fired first
    TimedOut,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::TimedOut => "timed out",
        };
        f.write_str(name)
    }
}

/// What a successful drive did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveReport {
    /// Times the body returned `Pending`
    pub suspensions: usize,
    /// Times the loop was entered
    pub loop_runs: usize,
    /// Wall time spent driving
    pub elapsed: Duration,
}

/// Drives one coroutine body per call, bounded by a deadline
#[derive(Debug, Clone, Copy, Default)]
pub struct CoroutineDriver {
    timeout: Option<Duration>,
}

impl CoroutineDriver {
    /// Driver using the resolver's default timeout
    pub fn new() -> Self {
        Self { timeout: None }
    }

    /// Driver with an explicit timeout (the override may still extend it)
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    /// The explicit timeout, if any
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Drive the future produced by `body` to completion on `ctx`'s loop.
    ///
    /// Panics while polling, `Err` outcomes, failures of loop callbacks and the
    /// deadline are returned as the matching [`Error`]. On timeout the future is
    /// dropped without being polled again.
    pub fn run<T, B, Fut>(&self, ctx: &RunContext<T>, body: B) -> Result<DriveReport>
    where
        T: Send + 'static,
        B: FnOnce() -> Fut,
        Fut: Future,
        Fut::Output: TestOutcome,
    {
        let timeout = ctx.resolver().resolve(self.timeout);
        let mut run = CoroutineRun::new(body(), ctx.io_loop());

        let result = run.drive(ctx, timeout);
        let state = match &result {
            Ok(_) => RunState::Completed,
            Err(Error::Timeout(_)) => RunState::TimedOut,
            Err(_) => RunState::Failed,
        };
        log::debug!(
            "Coroutine {} after {} suspensions and {} loop runs (timeout {:?})",
            state,
            run.suspensions,
            run.loop_runs,
            timeout
        );
        result
    }
}

/// Drive `body` with a fresh loop and the default configuration
pub fn run_async<B, Fut>(body: B) -> Result<DriveReport>
where
    B: FnOnce(&RunContext) -> Fut,
    Fut: Future,
    Fut::Output: TestOutcome,
{
    let ctx: RunContext = RunContext::with_defaults(Arc::new(crate::event_loop::IoLoop::new()));
    let result = CoroutineDriver::new().run(&ctx, || body(&ctx));
    ctx.io_loop().close();
    result
}

struct CoroutineRun<Fut> {
    future: Pin<Box<Fut>>,
    notify: Arc<DriverWaker>,
    suspensions: usize,
    loop_runs: usize,
    started: Instant,
}

impl<Fut> CoroutineRun<Fut>
where
    Fut: Future,
    Fut::Output: TestOutcome,
{
    fn new(future: Fut, io_loop: &Arc<dyn EventLoop>) -> Self {
        Self {
            future: Box::pin(future),
            notify: Arc::new(DriverWaker {
                io_loop: Arc::downgrade(io_loop),
                woken: AtomicBool::new(false),
            }),
            suspensions: 0,
            loop_runs: 0,
            started: Instant::now(),
        }
    }

    fn report(&self) -> DriveReport {
        DriveReport {
            suspensions: self.suspensions,
            loop_runs: self.loop_runs,
            elapsed: self.started.elapsed(),
        }
    }

    /// Poll once; `Some` once the body has finished
    fn step(&mut self) -> Option<Result<()>> {
        let waker = waker(Arc::clone(&self.notify));
        let mut cx = Context::from_waker(&waker);
        let future = &mut self.future;
        match capture::guard(|| future.as_mut().poll(&mut cx)) {
            Ok(Poll::Ready(outcome)) => Some(outcome.into_outcome().map_err(Error::Callback)),
            Ok(Poll::Pending) => {
                self.suspensions += 1;
                None
            }
            Err(failure) => Some(Err(Error::Callback(failure))),
        }
    }

    fn drive<T>(&mut self, ctx: &RunContext<T>, timeout: Duration) -> Result<DriveReport>
    where
        T: Send + 'static,
    {
        if let Some(result) = self.step() {
            return result.map(|()| self.report());
        }

        let deadline = Deadline::arm(ctx.io_loop(), timeout);
        loop {
            ctx.run_loop()?;
            self.loop_runs += 1;

            if let Some(err) = ctx.take_failure() {
                return Err(err);
            }
            // An operation that fired in the same tick as the deadline still wins
            if self.notify.woken.swap(false, Ordering::AcqRel) {
                if let Some(result) = self.step() {
                    return result.map(|()| self.report());
                }
            }
            if deadline.expired() {
                return Err(Error::Timeout(timeout));
            }
        }
    }
}

/// Wakes the driver by halting the loop from a callback
struct DriverWaker {
    io_loop: Weak<dyn EventLoop>,
    woken: AtomicBool,
}

impl ArcWake for DriverWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if arc_self.woken.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(io_loop) = arc_self.io_loop.upgrade() {
            let weak = Weak::clone(&arc_self.io_loop);
            io_loop.add_callback(Box::new(move || {
                if let Some(io_loop) = weak.upgrade() {
                    io_loop.stop();
                }
            }));
        }
    }
}

/// The drive's deadline; cancelled when dropped
struct Deadline {
    io_loop: Weak<dyn EventLoop>,
    handle: TimeoutHandle,
    expired: Arc<AtomicBool>,
}

impl Deadline {
    fn arm(io_loop: &Arc<dyn EventLoop>, timeout: Duration) -> Self {
        let weak = Arc::downgrade(io_loop);
        let expired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&expired);
        let handle = io_loop.add_timeout(
            deadline_after(io_loop.time(), timeout),
            Box::new(move || {
                flag.store(true, Ordering::Release);
                if let Some(io_loop) = weak.upgrade() {
                    io_loop.stop();
                }
            }),
        );
        Self {
            io_loop: Arc::downgrade(io_loop),
            handle,
            expired,
        }
    }

    fn expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        if let Some(io_loop) = self.io_loop.upgrade() {
            io_loop.remove_timeout(self.handle);
        }
    }
}
