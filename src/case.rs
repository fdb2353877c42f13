//! Composed asynchronous test cases
//!
//! [`AsyncTestCase`] is the per-test unit: it builds a fresh event loop and
//! [`RunContext`], composes the loop's own fixture with the fixtures the test
//! declares, and runs the body between their setup and teardown. Nothing is
//! reused across cases.
//!
//! ```rust,no_run
//! use loop_harness::prelude::*;
//! use std::time::Duration;
//!
//! let marker = CompletionMarker::new("finished");
//! let done = marker.clone();
//! AsyncTestCase::new()
//!     .with_fixture(marker)
//!     .run(|ctx| {
//!         CoroutineDriver::with_timeout(Duration::from_secs(1)).run(ctx, || async move {
//!             ctx.sleep(Duration::from_millis(10)).await?;
//!             done.finish();
//!             Ok::<(), Error>(())
//!         })
//!     })
//!     .unwrap();
//! ```

use crate::bridge::{RunContext, Stopper};
use crate::config::HarnessConfig;
use crate::driver::{CoroutineDriver, DriveReport, TestOutcome};
use crate::error::Result;
use crate::event_loop::{EventLoop, IoLoop};
use crate::fixture::{Fixture, FixtureChain};
use crate::timeout::TimeoutResolver;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Builds the loop a case runs on
pub type LoopFactory = Box<dyn FnOnce() -> Arc<dyn EventLoop>>;

/// Ties the loop's lifetime to the fixture chain
struct LoopFixture<T> {
    handle: Stopper<T>,
}

impl<T: Send + 'static> Fixture for LoopFixture<T> {
    fn name(&self) -> &str {
        "event-loop"
    }

    fn setup(&mut self) -> Result<()> {
        self.handle.attach();
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        self.handle.detach();
        self.handle.io_loop().close();
        // A failure nobody waited for still fails the test
        match self.handle.take_failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// A test case composed of a fresh event loop and declared fixtures
pub struct AsyncTestCase<T = ()> {
    config: HarnessConfig,
    factory: LoopFactory,
    fixtures: FixtureChain,
    _stop_value: PhantomData<fn() -> T>,
}

impl AsyncTestCase<()> {
    /// A case using the default configuration and no stop value
    pub fn new() -> Self {
        Self::with_config(HarnessConfig::default())
    }
}

impl Default for AsyncTestCase<()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> AsyncTestCase<T> {
    /// A case using `config`
    pub fn with_config(config: HarnessConfig) -> Self {
        Self {
            config,
            factory: Box::new(|| Arc::new(IoLoop::new())),
            fixtures: FixtureChain::new(),
            _stop_value: PhantomData,
        }
    }

    /// Use a custom loop instead of a fresh [`IoLoop`]
    pub fn with_loop<F>(mut self, factory: F) -> Self
    where
        F: FnOnce() -> Arc<dyn EventLoop> + 'static,
    {
        self.factory = Box::new(factory);
        self
    }

    /// Compose another fixture provider after the ones already declared
    pub fn with_fixture(mut self, fixture: impl Fixture + 'static) -> Self {
        self.fixtures.push(fixture);
        self
    }

    /// The case's configuration
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Set up, run `body`, and tear down.
    ///
    /// The loop fixture is set up first and torn down last. Teardown surfaces
    /// any callback failure that no wait consumed.
    pub fn run<R, F>(self, body: F) -> Result<R>
    where
        F: FnOnce(&RunContext<T>) -> Result<R>,
    {
        let io_loop = (self.factory)();
        let ctx = RunContext::new(io_loop, TimeoutResolver::from_config(&self.config));

        log::info!(
            "Starting async test case with {} declared fixtures",
            self.fixtures.len()
        );

        let mut chain = FixtureChain::new()
            .with(LoopFixture {
                handle: ctx.stopper(),
            })
            .with(self.fixtures);
        let result = chain.run(|| body(&ctx));
        if let Err(err) = &result {
            log::info!("Async test case failed: {}", err);
        }
        result
    }

    /// Run a coroutine body with `driver` inside the case's lifecycle
    pub fn run_async<B, Fut>(self, driver: &CoroutineDriver, body: B) -> Result<DriveReport>
    where
        B: FnOnce(&RunContext<T>) -> Fut,
        Fut: Future,
        Fut::Output: TestOutcome,
    {
        self.run(|ctx| driver.run(ctx, || body(ctx)))
    }
}
