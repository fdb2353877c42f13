//! Suspension points for coroutine-style test bodies
//!
//! A [`TaskFuture`] is a pending operation the event loop will eventually
//! resolve. [`task`] hands a [`Resolver`] to a closure that arranges for the
//! loop (or any other thread) to complete it.

use crate::error::{Error, Result};
use crate::event_loop::{deadline_after, EventLoop};
use futures::channel::oneshot;
use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Completes the [`TaskFuture`] it was created with
pub struct Resolver<R> {
    sender: oneshot::Sender<R>,
}

impl<R> Resolver<R> {
    /// Complete the task with `value`
    pub fn resolve(self, value: R) {
        // The awaiting side may already be gone after a timeout
        let _ = self.sender.send(value);
    }
}

/// A pending operation resolved through a [`Resolver`]
#[must_use = "futures do nothing unless awaited"]
pub struct TaskFuture<R> {
    receiver: oneshot::Receiver<R>,
}

impl<R> Future for TaskFuture<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.receiver.poll_unpin(cx).map(|result| {
            result.map_err(|_| Error::RuntimeError {
                reason: "Task resolver was dropped without resolving".to_string(),
            })
        })
    }
}

/// Start an operation and return a future for its result
pub fn task<R, F>(start: F) -> TaskFuture<R>
where
    F: FnOnce(Resolver<R>),
{
    let (sender, receiver) = oneshot::channel();
    start(Resolver { sender });
    TaskFuture { receiver }
}

/// Resolves on the loop's next tick
pub fn next_tick<L>(io_loop: &L) -> TaskFuture<()>
where
    L: EventLoop + ?Sized,
{
    task(|done| io_loop.add_callback(Box::new(move || done.resolve(()))))
}

/// Resolves once the loop passes `deadline`
pub fn sleep_until<L>(io_loop: &L, deadline: Instant) -> TaskFuture<()>
where
    L: EventLoop + ?Sized,
{
    task(|done| {
        io_loop.add_timeout(deadline, Box::new(move || done.resolve(())));
    })
}

/// Resolves once `delay` has elapsed on the loop's clock
pub fn sleep<L>(io_loop: &L, delay: Duration) -> TaskFuture<()>
where
    L: EventLoop + ?Sized,
{
    sleep_until(io_loop, deadline_after(io_loop.time(), delay))
}
