//! Event fan-out for circuit breaker activity
//!
//! Every call outcome, rejection, state transition and registry change is
//! published as one `BreakerEvent`. Subscribers each own an unbounded channel,
//! so publishing never blocks the thread that caused the event and a slow
//! subscriber never loses events.

use crate::CircuitState;
use arc_swap::ArcSwap;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

/// What happened
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerEventKind {
    /// A guarded call completed successfully
    Success { elapsed: Duration },
    /// A guarded call failed and the failure was recorded
    Error { elapsed: Duration },
    /// A guarded call failed but the classifier ignored the error
    IgnoredError { elapsed: Duration },
    /// A call was rejected without running
    NotPermitted,
    /// A guarded async call exceeded its time limit
    Timeout { after: Duration },
    StateTransition {
        from: CircuitState,
        to: CircuitState,
    },
    /// The circuit was reset to closed with an empty window
    Reset,
    /// The registry created the circuit
    Created,
    /// The registry removed the circuit
    Removed,
}

/// A single occurrence on a named circuit
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerEvent {
    pub circuit_name: String,
    pub kind: BreakerEventKind,
    /// Monotonic time of the circuit's clock, in seconds
    pub timestamp: f64,
}

type Subscribers = Vec<mpsc::UnboundedSender<BreakerEvent>>;

/// Fans events out to every live subscriber
///
/// Publishing loads a snapshot of the subscriber list and never takes a lock,
/// so circuits sharing one publisher do not contend with each other.
/// Subscribing and pruning swap in a new list.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    subscribers: Arc<ArcSwap<Subscribers>>,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(ArcSwap::from_pointee(Vec::new())),
        }
    }
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new stream that receives every event published from now on
    ///
    /// The stream is unbounded: events queue up until they are received, so
    /// a subscriber that is never drained keeps every event in memory.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.rcu(|current| {
            let mut next: Subscribers = current
                .iter()
                .filter(|existing| !existing.is_closed())
                .cloned()
                .collect();
            next.push(tx.clone());
            next
        });
        EventStream { rx }
    }

    /// Number of subscribers that have not been dropped yet
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .load()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Deliver an event to all subscribers, pruning closed ones
    pub fn publish(&self, circuit_name: &str, kind: BreakerEventKind, timestamp: f64) {
        let subscribers = self.subscribers.load();
        if subscribers.is_empty() {
            return;
        }

        let event = BreakerEvent {
            circuit_name: circuit_name.to_string(),
            kind,
            timestamp,
        };
        let mut closed = false;
        for tx in subscribers.iter() {
            closed |= tx.send(event.clone()).is_err();
        }

        if closed {
            self.prune();
        }
    }

    fn prune(&self) {
        self.subscribers.rcu(|current| {
            current
                .iter()
                .filter(|tx| !tx.is_closed())
                .cloned()
                .collect::<Subscribers>()
        });
    }
}

/// Receiving side of an event subscription
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<BreakerEvent>,
}

impl EventStream {
    /// Wait for the next event; `None` once every publisher is gone
    pub async fn recv(&mut self) -> Option<BreakerEvent> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued
    pub fn try_recv(&mut self) -> Option<BreakerEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything queued so far
    pub fn drain(&mut self) -> Vec<BreakerEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

impl Stream for EventStream {
    type Item = BreakerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
