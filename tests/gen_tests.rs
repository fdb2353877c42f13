//! Integration tests for coroutine-style test bodies
//!
//! Each test pairs the body with a [`CompletionMarker`] so that a body which
//! stops before its last line fails the case at teardown.

mod common;

use common::{case, config_with, secs};
use loop_harness::prelude::*;
use std::sync::Arc;
use std::time::Instant;

#[test]
fn test_sync() {
    let marker = CompletionMarker::new("gen-sync");
    let done = marker.clone();

    let report = case()
        .with_fixture(marker)
        .run(|ctx| {
            CoroutineDriver::new().run(ctx, || async move {
                done.finish();
            })
        })
        .unwrap();

    assert_eq!(report.suspensions, 0);
    assert_eq!(report.loop_runs, 0);
}

#[test]
fn test_async() {
    let marker = CompletionMarker::new("gen-async");
    let done = marker.clone();

    let report = case()
        .with_fixture(marker)
        .run(|ctx| {
            CoroutineDriver::new().run(ctx, || async move {
                ctx.next_tick().await?;
                done.finish();
                Ok::<(), Error>(())
            })
        })
        .unwrap();

    assert_eq!(report.suspensions, 1);
}

#[test]
fn test_timeout() {
    let marker = CompletionMarker::new("gen-timeout");
    let done = marker.clone();

    let err = case()
        .with_fixture(marker)
        .run(|ctx| {
            CoroutineDriver::with_timeout(secs(0.1)).run(ctx, || async move {
                let _ = ctx.sleep(secs(1.0)).await;
                done.finish();
            })
        })
        .unwrap_err();

    assert!(matches!(err, Error::Timeout(d) if d == secs(0.1)));
}

#[test]
fn test_no_timeout() {
    let marker = CompletionMarker::new("gen-no-timeout");
    let done = marker.clone();

    let report = case()
        .with_fixture(marker)
        .run(|ctx| {
            CoroutineDriver::with_timeout(secs(1.0)).run(ctx, || async move {
                ctx.sleep(secs(0.1)).await?;
                done.finish();
                Ok::<(), Error>(())
            })
        })
        .unwrap();

    assert!(report.elapsed >= secs(0.1));
    assert!(report.elapsed < secs(1.0));
}

#[test]
fn test_timeout_override_extends_explicit_timeout() {
    let source = Arc::new(StaticSource::with("TIMEOUT", "0.1"));

    AsyncTestCase::<()>::with_config(config_with(source))
        .run(|ctx| {
            // The override is shorter than the explicit bound, so it is ignored
            CoroutineDriver::with_timeout(secs(0.5)).run(ctx, || async move {
                let _ = ctx.sleep(secs(0.25)).await;
            })
        })
        .unwrap();
}

#[test]
fn test_timeout_override_is_the_effective_bound() {
    let source = Arc::new(StaticSource::with("TIMEOUT", "0.1"));
    let start = Instant::now();

    let err = AsyncTestCase::<()>::with_config(config_with(source))
        .run(|ctx| {
            CoroutineDriver::with_timeout(secs(0.01)).run(ctx, || async move {
                let _ = ctx.sleep(secs(1.0)).await;
            })
        })
        .unwrap_err();

    assert!(matches!(err, Error::Timeout(d) if d == secs(0.1)));
    assert!(start.elapsed() >= secs(0.1));
}

#[test]
fn test_override_is_read_at_each_drive() {
    let source = Arc::new(StaticSource::new());
    let handle = Arc::clone(&source);

    AsyncTestCase::<()>::with_config(config_with(source))
        .run(|ctx| {
            let first = CoroutineDriver::with_timeout(secs(0.01)).run(ctx, || async move {
                let _ = ctx.sleep(secs(0.05)).await;
            });
            assert!(first.unwrap_err().is_timeout());

            handle.set("TIMEOUT", "0.5");
            CoroutineDriver::with_timeout(secs(0.01)).run(ctx, || async move {
                let _ = ctx.sleep(secs(0.05)).await;
            })
        })
        .unwrap();
}

#[test]
fn test_invalid_override_is_ignored() {
    let source = Arc::new(StaticSource::with("TIMEOUT", "soon"));

    let err = AsyncTestCase::<()>::with_config(config_with(source))
        .run(|ctx| {
            CoroutineDriver::with_timeout(secs(0.05)).run(ctx, || async move {
                let _ = ctx.sleep(secs(1.0)).await;
            })
        })
        .unwrap_err();

    assert!(matches!(err, Error::Timeout(d) if d == secs(0.05)));
}

#[test]
fn test_environment_override() {
    // A key no other test reads, so setting it cannot race with them
    let key = "LOOP_HARNESS_GEN_TEST_TIMEOUT";
    std::env::set_var(key, "0.2");
    let config = HarnessConfig::default().with_override_key(key);

    let result = AsyncTestCase::<()>::with_config(config).run(|ctx| {
        CoroutineDriver::with_timeout(secs(0.01)).run(ctx, || async move {
            let _ = ctx.sleep(secs(0.05)).await;
        })
    });
    std::env::remove_var(key);

    result.unwrap();
}

#[test]
fn test_returned_error_fails_body() {
    let err = case()
        .run(|ctx| {
            CoroutineDriver::new().run(ctx, || async move {
                ctx.next_tick().await.expect("tick resolved");
                Err::<(), _>(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"))
            })
        })
        .unwrap_err();

    let io = err
        .failure()
        .and_then(|f| f.error::<std::io::Error>())
        .expect("io error preserved");
    assert_eq!(io.kind(), std::io::ErrorKind::ConnectionRefused);
}

#[test]
#[allow(dependency_on_unit_never_type_fallback)]
fn test_panic_after_resume_fails_body() {
    let err = case()
        .run(|ctx| {
            CoroutineDriver::new().run(ctx, || async move {
                ctx.sleep(secs(0.01)).await.expect("sleep resolved");
                panic!("after resume");
            })
        })
        .unwrap_err();

    assert!(err.failure().map_or(false, Failure::is_panic));
    assert_eq!(err.failure().map(Failure::message).as_deref(), Some("after resume"));
}

#[test]
fn test_run_async_with_case_lifecycle() {
    let marker = CompletionMarker::new("gen-lifecycle");
    let done = marker.clone();

    case()
        .with_fixture(marker)
        .run_async(&CoroutineDriver::with_timeout(secs(1.0)), |ctx| {
            let later = ctx.sleep(secs(0.02));
            async move {
                later.await?;
                done.finish();
                Ok::<(), Error>(())
            }
        })
        .unwrap();
}
