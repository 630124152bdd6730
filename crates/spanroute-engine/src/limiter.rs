//! Counting semaphore bounding concurrently outstanding probes.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Limits probes in flight to `parallel_requests`.
///
/// A sender acquires a permit before probing and moves it into the probe's
/// registry entry; dropping the taken probe returns the permit, so each probe
/// frees its slot exactly once no matter which path completes it.
pub struct ParallelLimiter {
    sem: Arc<Semaphore>,
    capacity: u32,
}

impl ParallelLimiter {
    pub fn new(parallel_requests: u16) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(usize::from(parallel_requests))),
            capacity: u32::from(parallel_requests),
        }
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.sem
            .clone()
            .acquire_owned()
            .await
            .expect("limiter semaphore closed")
    }

    /// Waits until every permit is back, i.e. no probe is outstanding.
    pub async fn wait_idle(&self) {
        let _all = self
            .sem
            .acquire_many(self.capacity)
            .await
            .expect("limiter semaphore closed");
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}
