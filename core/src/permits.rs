//! Half-open call quota
//!
//! While a circuit is half-open only a fixed number of trial calls may run.
//! The quota is an atomic counter refilled every time the circuit enters
//! half-open. Each refill starts a new generation so a permit handed out in an
//! earlier round can never be returned into a later one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Atomic quota of half-open trial calls
#[derive(Debug, Default)]
pub struct HalfOpenPermits {
    /// Trial calls still available in this round
    available: AtomicUsize,
    /// Size of the current round
    quota: AtomicUsize,
    /// Incremented on every refill
    generation: AtomicU64,
}

impl HalfOpenPermits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new half-open round with `quota` permits
    pub fn reset(&self, quota: usize) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.quota.store(quota, Ordering::Release);
        self.available.store(quota, Ordering::Release);
    }

    /// Take one permit from the current round without blocking
    ///
    /// Returns the generation the permit belongs to, or `None` when the
    /// quota is exhausted.
    pub fn try_acquire(&self) -> Option<u64> {
        let generation = self.generation.load(Ordering::Acquire);
        let mut current = self.available.load(Ordering::Acquire);

        loop {
            if current == 0 {
                return None;
            }

            match self.available.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(generation),
                Err(actual) => current = actual,
            }
        }
    }

    /// Return a permit taken in `generation`, if that round is still running
    pub fn release(&self, generation: u64) {
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }

        let quota = self.quota.load(Ordering::Acquire);
        let _ = self
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |available| {
                (available < quota).then_some(available + 1)
            });
    }

    /// Permits still available in the current round
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    /// Generation of the current round
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Admission ticket returned by `CircuitBreaker::try_acquire_permission`
///
/// Hand it back through `on_success`/`on_error` once the call finishes. A
/// permit dropped without reporting an outcome (a cancelled future, a panic)
/// gives its half-open slot back.
#[derive(Debug)]
pub struct Permit {
    half_open: Option<(Arc<HalfOpenPermits>, u64)>,
}

impl Permit {
    /// Permit granted outside of half-open; holds nothing
    pub(crate) fn unrestricted() -> Self {
        Self { half_open: None }
    }

    pub(crate) fn half_open(permits: Arc<HalfOpenPermits>, generation: u64) -> Self {
        Self {
            half_open: Some((permits, generation)),
        }
    }

    /// Generation of the half-open round this permit was taken from
    pub fn half_open_generation(&self) -> Option<u64> {
        self.half_open.as_ref().map(|(_, generation)| *generation)
    }

    /// Mark the slot as used so dropping the permit keeps it consumed
    pub(crate) fn consume(mut self) -> Option<u64> {
        self.half_open.take().map(|(_, generation)| generation)
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some((permits, generation)) = self.half_open.take() {
            permits.release(generation);
        }
    }
}
