//! Common helpers for loop-harness integration tests
//!
//! Tests build their cases from a configuration whose override source is a
//! private [`StaticSource`], so a `TIMEOUT` variable in the environment running
//! the suite cannot change their deadlines.

#![allow(dead_code)]

use loop_harness::prelude::*;
use parking_lot::Mutex;
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT: Once = Once::new();

/// Initialize the test environment once
pub fn init_test_env() {
    INIT.call_once(|| {
        log::debug!("loop-harness integration tests starting");
    });
}

/// A configuration isolated from the process environment
pub fn quiet_config() -> HarnessConfig {
    init_test_env();
    HarnessConfig::default().with_overrides(Arc::new(StaticSource::new()))
}

/// A configuration whose `TIMEOUT` override is read from `source`
pub fn config_with(source: Arc<StaticSource>) -> HarnessConfig {
    init_test_env();
    HarnessConfig::default().with_overrides(source)
}

/// A fresh case with no stop value
pub fn case() -> AsyncTestCase {
    AsyncTestCase::<()>::with_config(quiet_config())
}

/// Shorthand for fractional seconds
pub fn secs(s: f64) -> Duration {
    Duration::from_secs_f64(s)
}

/// Shared, ordered log of lifecycle events
pub type Events = Arc<Mutex<Vec<String>>>;

/// A fixture that appends `"<name> setUp"` and `"<name> tearDown"` to `events`
pub fn recorder(events: &Events, name: &str) -> FnFixture {
    let (up, down) = (Arc::clone(events), Arc::clone(events));
    let (on_setup, on_teardown) = (format!("{} setUp", name), format!("{} tearDown", name));
    FnFixture::new(
        name,
        move || {
            up.lock().push(on_setup.clone());
            Ok(())
        },
        move || {
            down.lock().push(on_teardown.clone());
            Ok(())
        },
    )
}
