use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument};

use crate::traits::PipelineError;

/// Bounded permit pool limiting how many items are in flight at once.
///
/// A permit is handed out as a [`ReleaseHandle`] that travels with the item
/// through the pipeline. The pool is instrumented so callers can verify the
/// bound and the acquire/release balance.
#[derive(Debug, Clone)]
pub struct Throttle {
    semaphore: Arc<Semaphore>,
    stats: Arc<ThrottleStats>,
    permits: usize,
}

impl Throttle {
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            stats: Arc::new(ThrottleStats::default()),
            permits,
        }
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    /// Waits for a free permit.
    ///
    /// Not cancellation-aware on its own; stages race it against their
    /// cancellation token.
    #[instrument(skip(self), level = "trace")]
    pub async fn acquire(&self) -> Result<ReleaseHandle, PipelineError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PipelineError::Wiring(format!("Semaphore error: {}", e)))?;

        self.stats.acquired.fetch_add(1, Ordering::SeqCst);
        let held = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(held, Ordering::SeqCst);
        debug!(held, "throttle permit acquired");

        Ok(ReleaseHandle {
            permit: Some(permit),
            stats: Arc::clone(&self.stats),
        })
    }

    pub fn stats(&self) -> ThrottleSnapshot {
        self.stats.snapshot()
    }
}

/// Counters maintained by a [`Throttle`].
#[derive(Debug, Default)]
pub struct ThrottleStats {
    acquired: AtomicUsize,
    released: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ThrottleStats {
    fn snapshot(&self) -> ThrottleSnapshot {
        ThrottleSnapshot {
            acquired: self.acquired.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak: self.peak.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time copy of the throttle counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleSnapshot {
    pub acquired: usize,
    pub released: usize,
    pub in_flight: usize,
    pub peak: usize,
}

/// Capability to free exactly one throttle permit.
///
/// [`ReleaseHandle::release`] consumes the handle, so a permit cannot be
/// released twice. A handle dropped on an error or cancellation path
/// releases its permit in `Drop`.
#[derive(Debug)]
pub struct ReleaseHandle {
    permit: Option<OwnedSemaphorePermit>,
    stats: Arc<ThrottleStats>,
}

impl ReleaseHandle {
    pub fn release(mut self) {
        self.release_permit();
    }

    fn release_permit(&mut self) {
        if let Some(permit) = self.permit.take() {
            // Counters first: the permit only becomes available to other
            // acquirers once it is dropped below.
            self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.stats.released.fetch_add(1, Ordering::SeqCst);
            drop(permit);
        }
    }
}

impl Drop for ReleaseHandle {
    fn drop(&mut self) {
        self.release_permit();
    }
}
