//! Helpers for testing the coalescing cache and the aggregator.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Factories created by [`resolve_after`] and [`fail_after`] sleep on the tokio timer. Run
//!    tests that use non-zero delays with paused time (`#[tokio::test(start_paused = true)]`),
//!    so that they complete instantly and timing assertions are exact.
//!
//!  - A [`Calls`] counter is shared by all factories created from it. Use one counter per
//!    resource to assert how often it was actually fetched.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `fanout_service` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("fanout_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// The error produced by failing test factories.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TestError(pub String);

impl TestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Counts how often factories were invoked.
#[derive(Debug, Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one invocation.
    pub fn record(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the number of invocations so far.
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A boxed factory future, as returned by the scripted factories.
pub type TestFuture<T> = BoxFuture<'static, Result<T, TestError>>;

/// Creates a factory that resolves to `value` after `delay`.
///
/// The invocation is recorded in `calls` when the factory is called, not when its future
/// completes.
pub fn resolve_after<T>(
    calls: &Calls,
    delay: Duration,
    value: T,
) -> impl FnOnce() -> TestFuture<T> + Send + 'static
where
    T: Send + 'static,
{
    let calls = calls.clone();
    move || {
        calls.record();
        Box::pin(async move {
            sleep(delay).await;
            Ok(value)
        })
    }
}

/// Creates a factory that fails with a [`TestError`] carrying `message` after `delay`.
pub fn fail_after<T>(
    calls: &Calls,
    delay: Duration,
    message: &str,
) -> impl FnOnce() -> TestFuture<T> + Send + 'static
where
    T: Send + 'static,
{
    let calls = calls.clone();
    let error = TestError::new(message);
    move || {
        calls.record();
        Box::pin(async move {
            sleep(delay).await;
            Err(error)
        })
    }
}

/// Creates a factory that never resolves.
pub fn pending<T>(calls: &Calls) -> impl FnOnce() -> TestFuture<T> + Send + 'static
where
    T: Send + 'static,
{
    let calls = calls.clone();
    move || {
        calls.record();
        Box::pin(futures::future::pending())
    }
}

/// Creates a factory that resolves to a JSON document after `delay`.
pub fn json_after(
    calls: &Calls,
    delay: Duration,
    value: serde_json::Value,
) -> impl FnOnce() -> TestFuture<serde_json::Value> + Send + 'static {
    resolve_after(calls, delay, value)
}

async fn sleep(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
