//! Bounded-concurrency gate for calls to the extraction service.
//!
//! One gate is built at startup and handed to every worker; all documents
//! processed by that worker share its capacity.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
struct GateState {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Cloneable handle to a FIFO semaphore with in-flight instrumentation.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    state: Arc<GateState>,
}

impl ConcurrencyGate {
    /// A capacity of zero is treated as one slot.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Arc::new(GateState {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    /// Wait for a free slot. The slot is released when the permit drops.
    pub async fn acquire(&self) -> GatePermit {
        // The semaphore is never closed, so acquisition only fails if that
        // invariant is broken; fall back to an unbounded permit in that case.
        let permit = Arc::clone(&self.state.semaphore).acquire_owned().await.ok();
        if permit.is_none() {
            tracing::warn!("concurrency gate closed; proceeding without a slot");
        }
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(now, Ordering::SeqCst);
        GatePermit {
            _permit: permit,
            state: Arc::clone(&self.state),
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously held permits observed so far.
    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.state.semaphore.available_permits()
    }
}

/// RAII slot in a [`ConcurrencyGate`].
#[derive(Debug)]
pub struct GatePermit {
    _permit: Option<OwnedSemaphorePermit>,
    state: Arc<GateState>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
