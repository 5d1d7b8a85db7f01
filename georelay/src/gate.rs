//! Process-wide limit on concurrent upstream calls.
//!
//! Every call to the elevation backend holds a [`GatePermit`] for its whole
//! duration. The permit is released when dropped, so early returns and errors
//! release it too. Waiters are served in FIFO order.
//!
//! ```ignore
//! let gate = Arc::new(ConcurrencyGate::new(16));
//!
//! let _permit = gate.acquire().await?;
//! // upstream call happens here
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};

/// Bounded counter guarding upstream calls.
#[derive(Debug)]
pub struct ConcurrencyGate {
    semaphore: Semaphore,
    max_permits: usize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ConcurrencyGate {
    /// Create a gate admitting at most `max_concurrent` calls (minimum 1).
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Semaphore::new(max_concurrent),
            max_permits: max_concurrent,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Wait for a slot.
    ///
    /// # Errors
    ///
    /// Fails only after [`close`](Self::close) has been called.
    pub async fn acquire(&self) -> Result<GatePermit<'_>, AcquireError> {
        let permit = self.semaphore.acquire().await?;
        Ok(self.track(permit))
    }

    fn track<'a>(&'a self, permit: SemaphorePermit<'a>) -> GatePermit<'a> {
        let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::Relaxed);
        GatePermit {
            _permit: permit,
            in_flight: &self.in_flight,
        }
    }

    /// Refuse all pending and future acquisitions.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn max_permits(&self) -> usize {
        self.max_permits
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Highest number of simultaneous calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }
}

/// A held slot; released on drop.
#[derive(Debug)]
pub struct GatePermit<'a> {
    _permit: SemaphorePermit<'a>,
    in_flight: &'a AtomicUsize,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
