//! Stop/wait bridge between synchronous test code and the event loop
//!
//! A test schedules work on the loop and then calls [`RunContext::wait`], which
//! runs the loop until something calls [`RunContext::stop`] (directly, from a
//! loop callback, or through a [`Stopper`] on another thread), the wait's
//! timeout fires, or a loop callback fails.
//!
//! Each wait cycle arms its own timeout. Arming a new one cancels the previous
//! handle, every stop cancels the current one, and a timeout that fires anyway
//! is ignored unless it belongs to the cycle that is still waiting.

use crate::capture::FailureSlot;
use crate::error::{Error, Failure, Result};
use crate::event_loop::{deadline_after, Callback, EventLoop, TimeoutHandle};
use crate::task::{self, TaskFuture};
use crate::timeout::TimeoutResolver;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct BridgeState<T> {
    /// A stop arrived since the last completed wait
    stopped: bool,
    stop_value: Option<T>,
    /// The loop is running on behalf of this context
    running: bool,
    pending_timeout: Option<TimeoutHandle>,
    /// Incremented each time a wait arms a timeout
    generation: u64,
}

struct Shared<T> {
    io_loop: Arc<dyn EventLoop>,
    state: Mutex<BridgeState<T>>,
    failures: FailureSlot,
}

impl<T: Send + 'static> Shared<T> {
    fn stop(&self, value: Option<T>) {
        let mut state = self.state.lock();
        state.stop_value = value;
        state.stopped = true;
        self.halt_locked(state);
    }

    /// End the current loop run without recording a stop
    fn halt(&self) {
        let state = self.state.lock();
        self.halt_locked(state);
    }

    fn halt_locked(&self, mut state: MutexGuard<'_, BridgeState<T>>) {
        if let Some(handle) = state.pending_timeout.take() {
            self.io_loop.remove_timeout(handle);
        }
        let was_running = std::mem::replace(&mut state.running, false);
        drop(state);
        if was_running {
            self.io_loop.stop();
        }
    }

    fn surfaced(&self, state: &BridgeState<T>) -> bool {
        state.stopped || self.failures.is_set()
    }

    fn arm_timeout(self: &Arc<Self>, state: &mut BridgeState<T>, timeout: Duration) -> u64 {
        if let Some(stale) = state.pending_timeout.take() {
            self.io_loop.remove_timeout(stale);
        }
        state.generation += 1;
        let generation = state.generation;

        let weak = Arc::downgrade(self);
        let handle = self.io_loop.add_timeout(
            deadline_after(self.io_loop.time(), timeout),
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_timeout(generation, timeout);
                }
            }),
        );
        state.pending_timeout = Some(handle);
        generation
    }

    fn on_timeout(&self, generation: u64, timeout: Duration) {
        let mut state = self.state.lock();
        if state.generation != generation || state.stopped {
            log::debug!("Ignoring stale timeout from wait cycle {}", generation);
            return;
        }
        // This handle just fired; nothing left to cancel
        state.pending_timeout = None;
        self.failures.record(Error::Timeout(timeout));
        self.halt_locked(state);
    }

    fn attach(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.io_loop.set_failure_handler(Some(Arc::new(move |failure: Failure| {
            match weak.upgrade() {
                Some(shared) => {
                    shared.failures.record(Error::Callback(failure));
                    shared.halt();
                }
                None => log::error!("Callback failed after its test finished: {}", failure),
            }
        })));
    }

    fn detach(&self) {
        self.io_loop.set_failure_handler(None);
    }

    fn run_loop(&self) -> Result<()> {
        self.state.lock().running = true;
        let result = self.io_loop.run();
        self.state.lock().running = false;
        result
    }
}

/// Per-test bridge state and the loop it drives
pub struct RunContext<T = ()> {
    shared: Arc<Shared<T>>,
    resolver: TimeoutResolver,
}

impl<T: Send + 'static> RunContext<T> {
    /// Create a context for `io_loop` and install its failure handler
    pub fn new(io_loop: Arc<dyn EventLoop>, resolver: TimeoutResolver) -> Self {
        let shared = Arc::new(Shared {
            io_loop,
            state: Mutex::new(BridgeState {
                stopped: false,
                stop_value: None,
                running: false,
                pending_timeout: None,
                generation: 0,
            }),
            failures: FailureSlot::new(),
        });
        shared.attach();
        Self { shared, resolver }
    }

    /// Create a context using the default configuration
    pub fn with_defaults(io_loop: Arc<dyn EventLoop>) -> Self {
        Self::new(io_loop, TimeoutResolver::default())
    }

    /// The loop this context drives
    pub fn io_loop(&self) -> &Arc<dyn EventLoop> {
        &self.shared.io_loop
    }

    /// The resolver used for wait and drive timeouts
    pub fn resolver(&self) -> &TimeoutResolver {
        &self.resolver
    }

    /// A cloneable, thread-safe handle that can stop this context
    pub fn stopper(&self) -> Stopper<T> {
        Stopper {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Signal the current (or next) wait to return with no value
    pub fn stop(&self) {
        self.shared.stop(None);
    }

    /// Signal the current (or next) wait to return `value`
    pub fn stop_with(&self, value: T) {
        self.shared.stop(Some(value));
    }

    /// A loop callback that calls [`RunContext::stop`]
    pub fn stop_callback(&self) -> Callback {
        self.stopper().into_callback()
    }

    /// Run the loop until stopped, using the resolved default timeout.
    ///
    /// A captured failure is returned as `Err`; a stop that was also pending
    /// is kept and satisfies the next wait.
    pub fn wait(&self) -> Result<Option<T>> {
        self.wait_for(None)
    }

    /// Run the loop until stopped, with `timeout` as the explicit bound.
    ///
    /// The configured override may extend `timeout` but never shortens it.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        self.wait_for(Some(timeout))
    }

    fn wait_for(&self, explicit: Option<Duration>) -> Result<Option<T>> {
        let shared = &self.shared;
        let mut state = shared.state.lock();

        if !shared.surfaced(&state) {
            let timeout = self.resolver.resolve(explicit);
            let generation = shared.arm_timeout(&mut state, timeout);
            log::debug!("Wait cycle {} armed with {:?} timeout", generation, timeout);

            // Someone else may stop the loop; keep running until it is for us
            while !shared.surfaced(&state) {
                state.running = true;
                let result = MutexGuard::unlocked(&mut state, || shared.io_loop.run());
                state.running = false;
                result?;
            }
        }

        if let Some(handle) = state.pending_timeout.take() {
            shared.io_loop.remove_timeout(handle);
        }
        // A stop that arrived alongside a failure stays buffered for the next wait
        if let Some(err) = shared.failures.take() {
            return Err(err);
        }
        state.stopped = false;
        Ok(state.stop_value.take())
    }

    /// Consume a failure captured outside of any wait
    pub fn take_failure(&self) -> Option<Error> {
        self.shared.failures.take()
    }

    /// Whether a captured failure is waiting to be surfaced
    pub fn has_failure(&self) -> bool {
        self.shared.failures.is_set()
    }

    /// Suspension point resolved on the loop's next tick
    pub fn next_tick(&self) -> TaskFuture<()> {
        task::next_tick(self.io_loop().as_ref())
    }

    /// Suspension point resolved after `delay`
    pub fn sleep(&self, delay: Duration) -> TaskFuture<()> {
        task::sleep(self.io_loop().as_ref(), delay)
    }

    /// Suspension point resolved once the loop passes `deadline`
    pub fn sleep_until(&self, deadline: Instant) -> TaskFuture<()> {
        task::sleep_until(self.io_loop().as_ref(), deadline)
    }

    /// Run the loop once, marked as running for this context
    pub(crate) fn run_loop(&self) -> Result<()> {
        self.shared.run_loop()
    }
}

/// Handle for stopping a [`RunContext`] from callbacks or other threads
pub struct Stopper<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Stopper<T> {
    fn clone(&self) -> Self {
        Stopper {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Stopper<T> {
    /// See [`RunContext::stop`]
    pub fn stop(&self) {
        self.shared.stop(None);
    }

    /// See [`RunContext::stop_with`]
    pub fn stop_with(&self, value: T) {
        self.shared.stop(Some(value));
    }

    /// Turn this handle into a loop callback that stops the context
    pub fn into_callback(self) -> Callback {
        Box::new(move || self.stop())
    }

    pub(crate) fn io_loop(&self) -> &Arc<dyn EventLoop> {
        &self.shared.io_loop
    }

    pub(crate) fn attach(&self) {
        self.shared.attach();
    }

    pub(crate) fn detach(&self) {
        self.shared.detach();
    }

    pub(crate) fn take_failure(&self) -> Option<Error> {
        self.shared.failures.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OverrideSource, StaticSource};
    use crate::event_loop::IoLoop;
    use std::sync::atomic::Ordering;
    use std::thread;

    #[derive(Debug, PartialEq)]
    struct ZeroDivision;

    fn context<T: Send + 'static>() -> (Arc<IoLoop>, RunContext<T>) {
        let resolver = TimeoutResolver::new(
            Arc::new(StaticSource::new()),
            "TIMEOUT",
            Duration::from_secs(5),
        );
        let io_loop = Arc::new(IoLoop::new());
        let ctx = RunContext::new(io_loop.clone(), resolver);
        (io_loop, ctx)
    }

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn test_stop_before_wait_is_buffered() {
        let (io_loop, ctx) = context::<&str>();
        ctx.stop_with("early");

        assert_eq!(ctx.wait().unwrap(), Some("early"));
        assert_eq!(io_loop.stats().runs.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_wait_returns_value_from_callback() {
        let (io_loop, ctx) = context::<u32>();
        let stopper = ctx.stopper();
        io_loop.add_callback(Box::new(move || stopper.stop_with(7)));

        assert_eq!(ctx.wait().unwrap(), Some(7));
        assert_eq!(io_loop.pending_timeouts(), 0);
    }

    #[test]
    fn test_callback_panic_surfaces_at_wait() {
        let (io_loop, ctx) = context::<()>();
        io_loop.add_callback(Box::new(|| std::panic::panic_any(ZeroDivision)));

        match ctx.wait() {
            Err(Error::Callback(failure)) => {
                assert_eq!(failure.payload::<ZeroDivision>(), Some(&ZeroDivision));
            }
            other => panic!("expected callback failure, got {:?}", other),
        }
        assert!(!ctx.has_failure());
    }

    #[test]
    fn test_first_failure_wins_and_loop_halts() {
        let (io_loop, ctx) = context::<()>();
        io_loop.add_callback(Box::new(|| panic!("first")));
        io_loop.add_callback(Box::new(|| panic!("second")));

        let err = ctx.wait().unwrap_err();
        assert_eq!(err.failure().and_then(|f| f.payload::<&str>()), Some(&"first"));
        assert_eq!(io_loop.pending_callbacks(), 1);
        io_loop.close();
    }

    #[test]
    fn test_wait_times_out() {
        let (_io_loop, ctx) = context::<()>();
        let start = Instant::now();

        match ctx.wait_timeout(secs(0.05)) {
            Err(Error::Timeout(d)) => assert_eq!(d, secs(0.05)),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(start.elapsed() >= secs(0.05));
    }

    #[test]
    fn test_subsequent_wait_calls_clear_first_timeout() {
        let (io_loop, ctx) = context::<()>();

        io_loop.call_later(secs(0.01), ctx.stop_callback());
        ctx.wait_timeout(secs(0.02)).unwrap();

        let start = Instant::now();
        io_loop.call_later(secs(0.03), ctx.stop_callback());
        ctx.wait_timeout(secs(0.15)).unwrap();
        assert!(start.elapsed() >= secs(0.03));
    }

    #[test]
    fn test_consumed_timeout_does_not_leak_into_next_wait() {
        let (io_loop, ctx) = context::<()>();
        assert!(ctx.wait_timeout(secs(0.01)).unwrap_err().is_timeout());

        let start = Instant::now();
        io_loop.call_later(secs(0.03), ctx.stop_callback());
        ctx.wait_timeout(secs(0.15)).unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= secs(0.03));
        assert!(elapsed < secs(0.15));
    }

    #[test]
    fn test_failure_outside_wait_surfaces_on_next_wait() {
        let (io_loop, ctx) = context::<()>();
        io_loop.add_callback(Box::new(|| panic!("while nobody waited")));
        io_loop.add_callback(ctx.stop_callback());

        // Drive the loop without a wait; the handler halts it on the panic
        ctx.run_loop().unwrap();
        assert!(ctx.has_failure());

        let runs = io_loop.stats().runs.load(Ordering::Relaxed);
        let err = ctx.wait().unwrap_err();
        assert!(err.failure().is_some());
        assert_eq!(io_loop.stats().runs.load(Ordering::Relaxed), runs);
        io_loop.close();
    }

    #[test]
    fn test_stop_from_another_thread() {
        let (_io_loop, ctx) = context::<String>();
        let stopper = ctx.stopper();

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            stopper.stop_with("from worker".to_string());
        });

        assert_eq!(ctx.wait_timeout(secs(1.0)).unwrap().as_deref(), Some("from worker"));
        worker.join().unwrap();
    }

    #[test]
    fn test_override_extends_wait_timeout() {
        let source = Arc::new(StaticSource::with("TIMEOUT", "0.5"));
        let overrides: Arc<dyn OverrideSource> = source.clone();
        let resolver = TimeoutResolver::new(overrides, "TIMEOUT", Duration::from_secs(5));
        let io_loop = Arc::new(IoLoop::new());
        let ctx: RunContext = RunContext::new(io_loop.clone(), resolver);

        io_loop.call_later(secs(0.05), ctx.stop_callback());
        ctx.wait_timeout(secs(0.01)).unwrap();
    }

    #[test]
    fn test_stale_timeout_is_ignored() {
        let (io_loop, ctx) = context::<()>();
        let stopper = ctx.stopper();

        // Stop and the timeout become due in the same tick; the stop wins
        let deadline = io_loop.time() + secs(0.02);
        io_loop.add_timeout(deadline, Box::new(move || stopper.stop()));
        ctx.wait_timeout(secs(0.02)).unwrap();
        assert!(!ctx.has_failure());
    }

    #[test]
    fn test_huge_override_does_not_overflow_deadline() {
        let resolver = TimeoutResolver::new(
            Arc::new(StaticSource::with("TIMEOUT", "1e19")),
            "TIMEOUT",
            Duration::from_secs(5),
        );
        let io_loop = Arc::new(IoLoop::new());
        let ctx: RunContext = RunContext::new(io_loop.clone(), resolver);

        io_loop.add_callback(ctx.stop_callback());
        ctx.wait().unwrap();
        assert_eq!(io_loop.pending_timeouts(), 0);
    }

    #[test]
    fn test_huge_explicit_timeout_does_not_overflow_deadline() {
        let (io_loop, ctx) = context::<()>();

        io_loop.call_later(secs(0.01), ctx.stop_callback());
        ctx.wait_timeout(Duration::MAX).unwrap();
        assert_eq!(io_loop.pending_timeouts(), 0);
    }

    #[test]
    fn test_stop_due_in_same_tick_as_timeout_wins() {
        let (io_loop, ctx) = context::<()>();

        // Both the stop and the wait's timeout are overdue once the blocker returns
        io_loop.call_later(secs(0.01), ctx.stop_callback());
        io_loop.add_callback(Box::new(|| thread::sleep(Duration::from_millis(100))));
        ctx.wait_timeout(secs(0.05)).unwrap();
        assert!(!ctx.has_failure());
    }

    #[test]
    fn test_stop_pending_with_failure_is_kept_for_next_wait() {
        let (io_loop, ctx) = context::<u32>();
        ctx.shared.failures.record(Error::RuntimeError {
            reason: "broken fixture".to_string(),
        });
        ctx.stop_with(7);

        assert!(matches!(ctx.wait(), Err(Error::RuntimeError { .. })));
        assert_eq!(ctx.wait().unwrap(), Some(7));
        assert_eq!(io_loop.stats().runs.load(Ordering::Relaxed), 0);
    }
}
