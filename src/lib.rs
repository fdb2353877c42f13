//! # LoopHarness
//!
//! Test-execution harness for code built on a callback-driven event loop.
//!
//! ## Features
//!
//! - **Event loop**: a single-threaded callback and timer loop behind the [`EventLoop`] trait
//! - **Stop/wait bridge**: synchronous test code blocks on [`RunContext::wait`] until loop work calls `stop`
//! - **Failure capture**: panics and errors raised inside loop callbacks are surfaced at the waiting call site
//! - **Coroutine driver**: run an `async` test body on the loop under a resolved deadline
//! - **Fixtures**: ordered setup/teardown composition with completion markers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use loop_harness::prelude::*;
//! use std::time::Duration;
//!
//! let ctx: RunContext = RunContext::with_defaults(std::sync::Arc::new(IoLoop::new()));
//! let stopper = ctx.stopper();
//! ctx.io_loop().call_later(Duration::from_millis(10), Box::new(move || stopper.stop()));
//! ctx.wait().unwrap();
//!
//! run_async(|ctx| {
//!     let tick = ctx.next_tick();
//!     async move {
//!         tick.await?;
//!         Ok::<(), Error>(())
//!     }
//! })
//! .unwrap();
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod bridge;
pub mod capture;
pub mod case;
pub mod config;
pub mod driver;
pub mod error;
pub mod event_loop;
pub mod fixture;
pub mod task;
pub mod timeout;

/// Convenient re-exports for common functionality
pub mod prelude {
    pub use crate::bridge::{RunContext, Stopper};
    pub use crate::case::AsyncTestCase;
    pub use crate::config::{EnvSource, HarnessConfig, OverrideSource, StaticSource, DEFAULT_TIMEOUT};
    pub use crate::driver::{run_async, CoroutineDriver, DriveReport, TestOutcome};
    pub use crate::error::{Error, Failure, Result};
    pub use crate::event_loop::{Callback, EventLoop, IoLoop, TimeoutHandle};
    pub use crate::fixture::{CompletionMarker, FixtureChain, Fixture, FnFixture, SharedFixture};
    pub use crate::task::{next_tick, sleep, sleep_until, task};
    pub use crate::timeout::{TimeoutResolver, TimeoutSpec};
}

pub use prelude::*;
