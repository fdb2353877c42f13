//! Fixture composition and lifecycle ordering
//!
//! A test case is composed from an ordered list of [`Fixture`] providers.
//! [`FixtureChain::run`] sets them up in declared order, runs the body, and
//! tears down in exactly the reverse order:
//!
//! ```text
//! constructed -> setup_1 .. setup_n -> body -> teardown_n .. teardown_1 -> destroyed
//! ```
//!
//! Teardown runs for every fixture whose setup succeeded, even when the body
//! or another teardown failed.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A reusable unit of setup/teardown behavior
pub trait Fixture {
    /// Name used in log lines
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Prepare state before the test body runs
    fn setup(&mut self) -> Result<()>;

    /// Release state after the test body ran
    fn teardown(&mut self) -> Result<()>;
}

type Hook = Box<dyn FnMut() -> Result<()>>;

/// A fixture built from two closures
pub struct FnFixture {
    name: String,
    setup: Hook,
    teardown: Hook,
}

impl FnFixture {
    /// Create a fixture from setup and teardown closures
    pub fn new<S, D>(name: impl Into<String>, setup: S, teardown: D) -> Self
    where
        S: FnMut() -> Result<()> + 'static,
        D: FnMut() -> Result<()> + 'static,
    {
        Self {
            name: name.into(),
            setup: Box::new(setup),
            teardown: Box::new(teardown),
        }
    }
}

impl Fixture for FnFixture {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self) -> Result<()> {
        (self.setup)()
    }

    fn teardown(&mut self) -> Result<()> {
        (self.teardown)()
    }
}

/// Ordered composition of fixture providers
#[derive(Default)]
pub struct FixtureChain {
    providers: Vec<Box<dyn Fixture>>,
    /// How many providers, from the front, are currently set up
    ready: usize,
}

impl FixtureChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a provider, builder style
    pub fn with(mut self, fixture: impl Fixture + 'static) -> Self {
        self.push(fixture);
        self
    }

    /// Append a provider
    pub fn push(&mut self, fixture: impl Fixture + 'static) {
        self.providers.push(Box::new(fixture));
    }

    /// Number of providers
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether the chain has no providers
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Set up every provider in order, stopping at the first failure
    pub fn setup_all(&mut self) -> Result<()> {
        while self.ready < self.providers.len() {
            let fixture = &mut self.providers[self.ready];
            log::debug!("Setting up fixture {}", fixture.name());
            fixture.setup()?;
            self.ready += 1;
        }
        Ok(())
    }

    /// Tear down every provider that is set up, in reverse order.
    ///
    /// All teardowns run; the first error is returned and later ones are logged.
    pub fn teardown_all(&mut self) -> Result<()> {
        let mut first_err = None;
        while self.ready > 0 {
            self.ready -= 1;
            let fixture = &mut self.providers[self.ready];
            log::debug!("Tearing down fixture {}", fixture.name());
            if let Err(err) = fixture.teardown() {
                if first_err.is_none() {
                    first_err = Some(err);
                } else {
                    log::error!("Teardown of {} also failed: {}", fixture.name(), err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Run `body` between setup and teardown of the whole chain.
    ///
    /// Error precedence: setup, then body, then teardown. A panic in the body is
    /// resumed after teardown has run.
    pub fn run<R, F>(&mut self, body: F) -> Result<R>
    where
        F: FnOnce() -> Result<R>,
    {
        let setup = self.setup_all();
        let body = match &setup {
            Ok(()) => Some(catch_unwind(AssertUnwindSafe(body))),
            Err(err) => {
                log::error!("Fixture setup failed, skipping test body: {}", err);
                None
            }
        };
        let teardown = self.teardown_all();

        match (setup, body) {
            (Err(err), _) => {
                if let Err(td) = teardown {
                    log::error!("Teardown after failed setup also failed: {}", td);
                }
                Err(err)
            }
            (Ok(()), Some(Err(panic))) => {
                if let Err(td) = teardown {
                    log::error!("Teardown after panicking body failed: {}", td);
                }
                resume_unwind(panic)
            }
            (Ok(()), Some(Ok(Err(err)))) => {
                if let Err(td) = teardown {
                    log::error!("Teardown after failing body also failed: {}", td);
                }
                Err(err)
            }
            (Ok(()), Some(Ok(Ok(value)))) => teardown.map(|()| value),
            (Ok(()), None) => unreachable!("body is skipped only when setup fails"),
        }
    }
}

/// Chains compose: a nested chain behaves as one provider
impl Fixture for FixtureChain {
    fn name(&self) -> &str {
        "FixtureChain"
    }

    fn setup(&mut self) -> Result<()> {
        if let Err(err) = self.setup_all() {
            // The outer chain will not tear us down; undo what we set up
            if let Err(td) = self.teardown_all() {
                log::error!("Unwinding nested fixture setup failed: {}", td);
            }
            return Err(err);
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        self.teardown_all()
    }
}

/// A provider that several branches of a composition may depend on.
///
/// Clones share one underlying fixture. It is set up when the first clone is
/// set up and torn down when the last set-up clone is torn down, so a base
/// composed into two branches still runs its setup and teardown once.
pub struct SharedFixture<F> {
    name: Arc<str>,
    inner: Arc<Mutex<SharedState<F>>>,
}

struct SharedState<F> {
    fixture: F,
    users: usize,
}

impl<F: Fixture> SharedFixture<F> {
    /// Share `fixture` between compositions
    pub fn new(fixture: F) -> Self {
        Self {
            name: Arc::from(fixture.name()),
            inner: Arc::new(Mutex::new(SharedState { fixture, users: 0 })),
        }
    }

    /// How many clones are currently set up
    pub fn users(&self) -> usize {
        self.inner.lock().users
    }
}

impl<F> Clone for SharedFixture<F> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: Fixture> Fixture for SharedFixture<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self) -> Result<()> {
        let mut state = self.inner.lock();
        if state.users == 0 {
            state.fixture.setup()?;
        } else {
            log::debug!("Fixture {} already set up by another branch", self.name);
        }
        state.users += 1;
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        let mut state = self.inner.lock();
        state.users = state.users.saturating_sub(1);
        if state.users == 0 {
            state.fixture.teardown()
        } else {
            Ok(())
        }
    }
}

/// Records whether a test body reached its designated end
#[derive(Debug, Clone)]
pub struct CompletionMarker {
    name: Arc<str>,
    reached: Arc<AtomicBool>,
}

impl CompletionMarker {
    /// Create an unfinished marker
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            reached: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark the body as finished
    pub fn finish(&self) {
        self.reached.store(true, Ordering::Release);
    }

    /// Whether [`CompletionMarker::finish`] was called
    pub fn is_finished(&self) -> bool {
        self.reached.load(Ordering::Acquire)
    }
}

impl Fixture for CompletionMarker {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self) -> Result<()> {
        self.reached.store(false, Ordering::Release);
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        if self.is_finished() {
            Ok(())
        } else {
            Err(Error::Incomplete {
                marker: self.name.to_string(),
            })
        }
    }
}
