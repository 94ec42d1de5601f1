//! Counting admission gate for concurrent chunk fetches.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::HarvestError;

/// Lets at most `capacity` holders in at once and records how many were in
/// at the busiest moment.
pub struct AdmissionGate {
    semaphore: Semaphore,
    capacity: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl AdmissionGate {
    /// Creates a gate.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Contract`] if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self, HarvestError> {
        if capacity == 0 {
            return Err(HarvestError::Contract {
                message: "admission gate capacity must be positive".to_string(),
            });
        }
        Ok(Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Waits for a slot. The slot is released when the pass is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Contract`] if the gate was closed.
    pub async fn enter(&self) -> Result<GatePass<'_>, HarvestError> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| HarvestError::Contract {
                message: "admission gate closed".to_string(),
            })?;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        Ok(GatePass {
            gate: self,
            _permit: permit,
        })
    }

    /// Maximum simultaneous holders.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current holders.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Most holders seen at once.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// A held slot.
pub struct GatePass<'a> {
    gate: &'a AdmissionGate,
    _permit: SemaphorePermit<'a>,
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
