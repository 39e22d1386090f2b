//! Concurrency gate for upload actions
//!
//! Bounds how many actions run at the same time. Waiting actions are served
//! in submission order (tokio's semaphore is FIFO-fair). A limit of 0 means
//! unlimited and the gate never waits.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::BoxFuture;
use tokio::sync::Semaphore;

/// Shared upload slot limiter
#[derive(Debug)]
pub struct ConcurrencyGate {
    limit: usize,
    /// None when unbounded
    semaphore: Option<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    peak: AtomicUsize,
}

impl ConcurrencyGate {
    /// Create a gate allowing `limit` concurrent actions (0 = unlimited)
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            semaphore: (limit > 0).then(|| Semaphore::new(limit)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
        }
    }

    /// Configured limit (0 = unlimited)
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn is_unbounded(&self) -> bool {
        self.semaphore.is_none()
    }

    /// Number of actions currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of actions that ran at once since creation
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Wait for a slot, run `action` to completion, then free the slot
    ///
    /// The slot is released exactly once whatever the action returns, and
    /// also if the returned future is dropped mid-way.
    pub async fn run<F, Fut, T>(&self, action: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        // The semaphore is never closed, so acquire only fails on teardown;
        // running without a permit then is harmless.
        let _permit = match &self.semaphore {
            Some(semaphore) => semaphore.acquire().await.ok(),
            None => None,
        };
        let _slot = SlotGuard::new(&self.in_flight, &self.peak);
        action().await
    }

    /// Wrap `action` so that invoking the result runs it through the gate
    pub fn limit_action<'a, F, Fut, T>(
        &'a self,
        action: F,
    ) -> impl FnOnce() -> BoxFuture<'a, T> + 'a
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = T> + Send + 'a,
        T: Send + 'a,
    {
        move || Box::pin(self.run(action))
    }
}

/// RAII guard that tracks a running action
struct SlotGuard {
    in_flight: Arc<AtomicUsize>,
}

impl SlotGuard {
    fn new(in_flight: &Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self {
            in_flight: Arc::clone(in_flight),
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
