//! Run-scoped remote cache state: the failure circuit breaker and the
//! cancellation token shared by every task in one run.

use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// Shared state for one invocation of the task runner.
///
/// Owned by the run and handed to the remote store behind an `Arc`; there is
/// no process-global counter, so two runs in one process do not interfere.
#[derive(Debug)]
pub struct RunState {
    failures: AtomicU64,
    max_failures: u64,
    trip_reported: AtomicBool,
    cancel: CancellationToken,
}

impl RunState {
    /// Fresh state that disables the remote after `max_failures` failures.
    #[must_use]
    pub fn new(max_failures: u64) -> Self {
        Self {
            failures: AtomicU64::new(0),
            max_failures,
            trip_reported: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Record one failed remote attempt and return the new total.
    pub fn record_failure(&self) -> u64 {
        self.failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Failures recorded so far.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Failure budget for this run.
    #[must_use]
    pub const fn max_failures(&self) -> u64 {
        self.max_failures
    }

    /// Whether the remote store is switched off for the rest of the run.
    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.failures() >= self.max_failures
    }

    /// Fail with [`Error::TooManyFailures`] once the breaker has tripped.
    pub fn check(&self) -> Result<()> {
        if self.is_tripped() {
            return Err(Error::TooManyFailures {
                failures: self.failures(),
            });
        }
        Ok(())
    }

    /// True exactly once, the first time it is called after the breaker trips.
    pub fn take_trip_notice(&self) -> bool {
        self.is_tripped() && !self.trip_reported.swap(true, Ordering::SeqCst)
    }

    /// Token cancelled when the run is interrupted.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Abort in-flight remote requests.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new(3)
    }
}
