//! Sliding windows of call outcomes
//!
//! This module provides two window implementations:
//! - `CountWindow`: the last N outcomes, ring-buffer style
//! - `TimeWindow`: outcomes of the last T seconds, in one bucket per second
//!
//! Both have fixed memory and keep running per-kind counts so rate queries
//! never scan the buffer.
//! The owning circuit is the only writer; snapshots can be taken from any thread.

use crate::{CallOutcome, OutcomeKind, clock::Clock};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// How the sliding window bounds its history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlidingWindowType {
    /// Keep the last `size` calls
    #[default]
    CountBased,
    /// Keep the calls of the last `size` seconds
    TimeBased,
}

/// Abstract sliding window over call outcomes
pub trait OutcomeWindow: Send + Sync + std::fmt::Debug {
    /// Record a finished call, evicting whatever falls out of the window
    fn record(&self, outcome: CallOutcome);

    /// Current counts per outcome kind
    fn snapshot(&self) -> WindowSnapshot;

    /// Drop every buffered outcome
    fn reset(&self);
}

/// Build the window described by a type and size
pub fn build_window(
    kind: SlidingWindowType,
    size: usize,
    clock: Arc<dyn Clock>,
) -> Arc<dyn OutcomeWindow> {
    match kind {
        SlidingWindowType::CountBased => Arc::new(CountWindow::new(size)),
        SlidingWindowType::TimeBased => Arc::new(TimeWindow::new(size, clock)),
    }
}

/// Point-in-time outcome counts of a window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub successes: usize,
    pub failures: usize,
    pub slow_successes: usize,
    pub slow_failures: usize,
}

impl WindowSnapshot {
    /// Number of buffered calls
    pub fn total(&self) -> usize {
        self.successes + self.failures + self.slow_successes + self.slow_failures
    }

    /// Calls that failed, slow or not
    pub fn failed(&self) -> usize {
        self.failures + self.slow_failures
    }

    /// Calls slower than the slow-call threshold, failed or not
    pub fn slow(&self) -> usize {
        self.slow_successes + self.slow_failures
    }

    /// Failure percentage, or -1.0 until `minimum_calls` are buffered
    pub fn failure_rate(&self, minimum_calls: usize) -> f32 {
        self.rate(self.failed(), minimum_calls)
    }

    /// Slow-call percentage, or -1.0 until `minimum_calls` are buffered
    pub fn slow_call_rate(&self, minimum_calls: usize) -> f32 {
        self.rate(self.slow(), minimum_calls)
    }

    fn rate(&self, matching: usize, minimum_calls: usize) -> f32 {
        let total = self.total();
        if total == 0 || total < minimum_calls {
            return -1.0;
        }
        matching as f32 * 100.0 / total as f32
    }

    pub(crate) fn add(&mut self, kind: OutcomeKind) {
        *self.slot(kind) += 1;
    }

    fn subtract(&mut self, other: &WindowSnapshot) {
        debug_assert!(
            self.successes >= other.successes
                && self.failures >= other.failures
                && self.slow_successes >= other.slow_successes
                && self.slow_failures >= other.slow_failures,
            "window count underflow"
        );
        self.successes = self.successes.saturating_sub(other.successes);
        self.failures = self.failures.saturating_sub(other.failures);
        self.slow_successes = self.slow_successes.saturating_sub(other.slow_successes);
        self.slow_failures = self.slow_failures.saturating_sub(other.slow_failures);
    }

    fn remove(&mut self, kind: OutcomeKind) {
        let slot = self.slot(kind);
        debug_assert!(*slot > 0, "window count underflow for {kind:?}");
        *slot = slot.saturating_sub(1);
    }

    fn slot(&mut self, kind: OutcomeKind) -> &mut usize {
        match kind {
            OutcomeKind::Success => &mut self.successes,
            OutcomeKind::Failure => &mut self.failures,
            OutcomeKind::SlowSuccess => &mut self.slow_successes,
            OutcomeKind::SlowFailure => &mut self.slow_failures,
        }
    }
}

#[derive(Debug, Default)]
struct CountRing {
    slots: VecDeque<OutcomeKind>,
    counts: WindowSnapshot,
}

/// Window over the last `capacity` calls
#[derive(Debug)]
pub struct CountWindow {
    capacity: usize,
    inner: RwLock<CountRing>,
}

impl CountWindow {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Window capacity must be greater than 0");
        Self {
            capacity,
            inner: RwLock::new(CountRing {
                slots: VecDeque::with_capacity(capacity),
                counts: WindowSnapshot::default(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl OutcomeWindow for CountWindow {
    fn record(&self, outcome: CallOutcome) {
        let mut ring = self.inner.write();

        if ring.slots.len() == self.capacity
            && let Some(evicted) = ring.slots.pop_front()
        {
            ring.counts.remove(evicted);
        }

        ring.slots.push_back(outcome.kind);
        ring.counts.add(outcome.kind);
    }

    fn snapshot(&self) -> WindowSnapshot {
        self.inner.read().counts
    }

    fn reset(&self) {
        let mut ring = self.inner.write();
        ring.slots.clear();
        ring.counts = WindowSnapshot::default();
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    second: u64,
    counts: WindowSnapshot,
}

#[derive(Debug)]
struct TimeRing {
    buckets: Box<[Bucket]>,
    /// Newest second the ring has been advanced to
    head: u64,
    counts: WindowSnapshot,
}

impl TimeRing {
    /// Recycle the buckets of every second that fell out of the window
    fn advance_to(&mut self, second: u64) {
        if second <= self.head {
            return;
        }

        let size = self.buckets.len() as u64;
        let stale = (second - self.head).min(size);
        for fresh in (second - stale + 1)..=second {
            let bucket = &mut self.buckets[(fresh % size) as usize];
            self.counts.subtract(&bucket.counts);
            *bucket = Bucket {
                second: fresh,
                counts: WindowSnapshot::default(),
            };
        }
        self.head = second;
    }
}

/// Window over the calls recorded during the last `window_secs` seconds
///
/// Outcomes are aggregated into one bucket per second, so memory is fixed at
/// `window_secs` buckets whatever the call rate. A bucket leaves the window
/// once it is `window_secs` seconds old.
#[derive(Debug)]
pub struct TimeWindow {
    clock: Arc<dyn Clock>,
    inner: RwLock<TimeRing>,
}

impl TimeWindow {
    pub fn new(window_secs: usize, clock: Arc<dyn Clock>) -> Self {
        assert!(window_secs > 0, "Window duration must be greater than 0");
        Self {
            clock,
            inner: RwLock::new(TimeRing {
                buckets: vec![Bucket::default(); window_secs].into_boxed_slice(),
                head: 0,
                counts: WindowSnapshot::default(),
            }),
        }
    }

    pub fn window_secs(&self) -> usize {
        self.inner.read().buckets.len()
    }

    fn current_second(&self) -> u64 {
        self.clock.monotonic_time().max(0.0) as u64
    }
}

impl OutcomeWindow for TimeWindow {
    fn record(&self, outcome: CallOutcome) {
        let mut ring = self.inner.write();
        let second = self.current_second().max(ring.head);
        ring.advance_to(second);

        let size = ring.buckets.len() as u64;
        let bucket = &mut ring.buckets[(second % size) as usize];
        debug_assert_eq!(bucket.second, second, "bucket not advanced");
        bucket.counts.add(outcome.kind);
        ring.counts.add(outcome.kind);
    }

    fn snapshot(&self) -> WindowSnapshot {
        let second = self.current_second();
        {
            let ring = self.inner.read();
            if second <= ring.head {
                return ring.counts;
            }
        }

        let mut ring = self.inner.write();
        ring.advance_to(second);
        ring.counts
    }

    fn reset(&self) {
        let mut ring = self.inner.write();
        ring.buckets.fill(Bucket::default());
        ring.head = 0;
        ring.counts = WindowSnapshot::default();
    }
}
