//! Cooperative single-threaded event loop
//!
//! [`IoLoop`] runs on whichever thread calls [`EventLoop::run`]. Each tick it
//! executes the callbacks that were queued before the tick started (FIFO), then
//! the timeouts that are due (deadline order). When there is nothing to do it
//! parks on a wakeup channel until the next deadline, or until another thread
//! queues a callback or requests a stop.
//!
//! Callbacks run under [`capture::guard`]; a panic is handed to the installed
//! [`FailureHandler`] instead of escaping `run`.

use super::timers::TimerQueue;
use super::{Callback, EventLoop, FailureHandler, TimeoutHandle};
use crate::capture;
use crate::error::{Error, Result};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

/// Counters describing what a loop has executed
#[derive(Debug, Default)]
pub struct LoopStats {
    /// Number of times `run` was entered
    pub runs: AtomicUsize,
    /// Callbacks executed (excluding timeouts)
    pub callbacks_run: AtomicUsize,
    /// Timeouts that fired
    pub timeouts_fired: AtomicUsize,
    /// Callbacks that panicked
    pub failures: AtomicUsize,
}

impl Clone for LoopStats {
    fn clone(&self) -> Self {
        LoopStats {
            runs: AtomicUsize::new(self.runs.load(Ordering::Relaxed)),
            callbacks_run: AtomicUsize::new(self.callbacks_run.load(Ordering::Relaxed)),
            timeouts_fired: AtomicUsize::new(self.timeouts_fired.load(Ordering::Relaxed)),
            failures: AtomicUsize::new(self.failures.load(Ordering::Relaxed)),
        }
    }
}

struct LoopState {
    callbacks: VecDeque<Callback>,
    timers: TimerQueue,
    stopping: bool,
}

/// The harness's event loop
pub struct IoLoop {
    state: Mutex<LoopState>,
    failure_handler: Mutex<Option<FailureHandler>>,
    running: AtomicBool,
    wakeup_tx: Sender<()>,
    wakeup_rx: Receiver<()>,
    stats: LoopStats,
    id: usize,
}

impl IoLoop {
    /// Create an idle loop
    pub fn new() -> Self {
        static LOOP_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

        // One pending token is enough to unpark the loop
        let (wakeup_tx, wakeup_rx) = bounded(1);
        Self {
            state: Mutex::new(LoopState {
                callbacks: VecDeque::new(),
                timers: TimerQueue::new(),
                stopping: false,
            }),
            failure_handler: Mutex::new(None),
            running: AtomicBool::new(false),
            wakeup_tx,
            wakeup_rx,
            stats: LoopStats::default(),
            id: LOOP_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Loop id for debugging
    pub fn id(&self) -> usize {
        self.id
    }

    /// Snapshot of the loop's counters
    pub fn stats(&self) -> LoopStats {
        self.stats.clone()
    }

    /// Number of callbacks waiting for the next tick
    pub fn pending_callbacks(&self) -> usize {
        self.state.lock().callbacks.len()
    }

    /// Number of live timeouts
    pub fn pending_timeouts(&self) -> usize {
        self.state.lock().timers.len()
    }

    fn wake(&self) {
        let _ = self.wakeup_tx.try_send(());
    }

    fn stop_requested(&self) -> bool {
        self.state.lock().stopping
    }

    fn dispatch(&self, callback: Callback) {
        if let Err(failure) = capture::guard(callback) {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            let handler = self.failure_handler.lock().clone();
            match handler {
                Some(handler) => handler(failure),
                None => log::error!("Unhandled failure in loop {} callback: {}", self.id, failure),
            }
        }
    }

    /// Run one tick; returns `false` once a stop was requested
    fn tick(&self) -> bool {
        let queued = self.state.lock().callbacks.len();
        for _ in 0..queued {
            let Some(callback) = self.state.lock().callbacks.pop_front() else {
                break;
            };
            self.dispatch(callback);
            self.stats.callbacks_run.fetch_add(1, Ordering::Relaxed);
            if self.stop_requested() {
                return false;
            }
        }

        let now = Instant::now();
        loop {
            let due = self.state.lock().timers.pop_due(now);
            let Some((handle, callback)) = due else {
                break;
            };
            log::trace!("Loop {} firing timeout {}", self.id, handle.id());
            self.dispatch(callback);
            self.stats.timeouts_fired.fetch_add(1, Ordering::Relaxed);
            if self.stop_requested() {
                return false;
            }
        }
        true
    }

    /// Park until there may be work, or the next deadline passes
    fn park(&self) {
        let next_deadline = {
            let mut state = self.state.lock();
            if state.stopping || !state.callbacks.is_empty() {
                return;
            }
            state.timers.next_deadline()
        };

        match next_deadline {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                if wait.is_zero() {
                    return;
                }
                if let Err(RecvTimeoutError::Disconnected) = self.wakeup_rx.recv_timeout(wait) {
                    log::warn!("Loop {} wakeup channel disconnected", self.id);
                }
            }
            None => {
                // Nothing scheduled: only another thread can give us work
                let _ = self.wakeup_rx.recv();
            }
        }
    }
}

impl Default for IoLoop {
    fn default() -> Self {
        Self::new()
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl EventLoop for IoLoop {
    fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::RuntimeError {
                reason: format!("IoLoop {} is already running", self.id),
            });
        }
        let _running = RunningGuard(&self.running);
        self.stats.runs.fetch_add(1, Ordering::Relaxed);
        log::trace!("Loop {} started", self.id);

        loop {
            {
                let mut state = self.state.lock();
                if state.stopping {
                    state.stopping = false;
                    break;
                }
            }
            if self.tick() {
                self.park();
            }
        }

        // Drain a stale wakeup so the next run does not spin once for nothing
        let _ = self.wakeup_rx.try_recv();
        log::trace!("Loop {} stopped", self.id);
        Ok(())
    }

    fn stop(&self) {
        self.state.lock().stopping = true;
        self.wake();
    }

    fn add_callback(&self, callback: Callback) {
        self.state.lock().callbacks.push_back(callback);
        self.wake();
    }

    fn add_timeout(&self, deadline: Instant, callback: Callback) -> TimeoutHandle {
        let handle = self.state.lock().timers.schedule(deadline, callback);
        self.wake();
        handle
    }

    fn remove_timeout(&self, handle: TimeoutHandle) -> bool {
        self.state.lock().timers.cancel(handle)
    }

    fn time(&self) -> Instant {
        Instant::now()
    }

    fn set_failure_handler(&self, handler: Option<FailureHandler>) {
        *self.failure_handler.lock() = handler;
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn close(&self) {
        // Callbacks are dropped outside the lock: they may own handles to this loop
        let (callbacks, timers) = {
            let mut state = self.state.lock();
            let callbacks = std::mem::take(&mut state.callbacks);
            let timers = std::mem::take(&mut state.timers);
            state.stopping = false;
            (callbacks, timers)
        };
        log::debug!(
            "Closing loop {}: discarding {} callbacks and {} timeouts",
            self.id,
            callbacks.len(),
            timers.len()
        );
        drop(callbacks);
        drop(timers);
    }
}
