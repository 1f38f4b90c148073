//! Helpers for testing the caches.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - [`CountingWork`] is cheap to clone, and all clones share their call counter. Move a clone
//!    into the work function of the cache and keep the original around for assertions.
//!
//!  - Async tests that rely on [`CountingWork::with_delay`] should run with paused time
//!    (`#[tokio::test(start_paused = true)]`), so they do not actually wait.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `flightcache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("flightcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// The error returned by a scripted failure of [`CountingWork`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TestError {
    /// The call with the given (1-based) number was scripted to fail.
    #[error("call {0} failed")]
    Scripted(usize),
}

/// A work function that counts its invocations.
///
/// Each invocation returns its own 1-based call number, so tests can tell apart which
/// invocation produced a value.
#[derive(Debug, Clone, Default)]
pub struct CountingWork {
    calls: Arc<AtomicUsize>,
    delay: Duration,
    failing: Arc<[usize]>,
}

impl CountingWork {
    /// Creates work that completes immediately and never fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every invocation take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Makes the invocations with the given call numbers fail.
    pub fn failing_on(mut self, calls: &[usize]) -> Self {
        self.failing = calls.into();
        self
    }

    /// The number of invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(&self) -> Result<usize, TestError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.contains(&call) {
            Err(TestError::Scripted(call))
        } else {
            Ok(call)
        }
    }

    /// Runs the work on the current thread, blocking for the configured delay.
    ///
    /// The call is counted before sleeping, so [`calls`](Self::calls) reflects computations
    /// that are still in flight.
    pub fn run<K: ?Sized>(&self, _key: &K) -> Result<usize, TestError> {
        let result = self.next();
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        result
    }

    /// Runs the work asynchronously, sleeping for the configured delay.
    pub async fn run_async<K>(self, _key: K) -> Result<usize, TestError> {
        let result = self.next();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        result
    }
}
