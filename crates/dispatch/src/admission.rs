//! Admission control
//!
//! Caps the number of outstanding (PENDING + RUNNING) tasks. A slot is taken
//! at submission and handed back exactly once, when the task reaches a
//! terminal state. Uses atomics only, no locks.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Submission refused because the ceiling is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("capacity exceeded: {outstanding}/{ceiling} tasks outstanding")]
pub struct CapacityExceeded {
    pub outstanding: usize,
    pub ceiling: usize,
}

/// Counts outstanding tasks against a fixed ceiling
#[derive(Debug)]
pub struct AdmissionController {
    ceiling: usize,
    outstanding: AtomicUsize,
}

impl AdmissionController {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Reserve one outstanding slot
    ///
    /// Check and increment happen in a single compare-and-swap, so concurrent
    /// callers can never push the count past the ceiling.
    pub fn try_acquire(&self) -> Result<(), CapacityExceeded> {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.ceiling).then_some(current + 1)
            })
            .map(|_| ())
            .map_err(|current| CapacityExceeded {
                outstanding: current,
                ceiling: self.ceiling,
            })
    }

    /// Hand one slot back
    pub fn release(&self) {
        let result = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });

        if result.is_err() {
            tracing::warn!("admission release without a matching acquire");
        }
    }

    /// Tasks currently holding a slot
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Slots still available
    pub fn available(&self) -> usize {
        self.ceiling.saturating_sub(self.outstanding())
    }
}
