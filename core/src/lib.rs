//! breaker-engine - Rate-based circuit breaker engine
//!
//! This crate provides a complete circuit breaker implementation with:
//! - Count-based or time-based sliding windows with O(1) rate queries
//! - State machine for the circuit lifecycle
//!   (Closed → Open → HalfOpen, plus Disabled and ForcedOpen)
//! - Atomic half-open trial quota that survives cancelled calls
//! - Blocking, async and stream call decorators with fallbacks
//! - A named registry with shared defaults and per-instance overrides
//! - Event streams and an optional metrics exporter binding
//!
//! # Example
//!
//! ```rust
//! use breaker_engine::CircuitBreaker;
//! use std::time::Duration;
//!
//! let circuit = CircuitBreaker::builder("my_service")
//!     .failure_rate_threshold(50.0)
//!     .sliding_window_size(10)
//!     .minimum_number_of_calls(5)
//!     .wait_duration_in_open_state(Duration::from_secs(30))
//!     .permitted_calls_in_half_open_state(2)
//!     .build()
//!     .expect("valid configuration");
//!
//! // Execute with circuit protection
//! let result = circuit.call(|| {
//!     // Your service call here
//!     Ok::<_, String>("success")
//! });
//! assert!(result.is_ok());
//!
//! // Check circuit state
//! if circuit.is_open() {
//!     println!("Circuit is open, skipping call");
//! }
//! ```

pub mod bootstrap;
pub mod builder;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod decorate;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod permits;
pub mod registry;
pub mod settings;
pub mod window;

use std::time::Duration;

pub use bootstrap::{Bootstrap, Customizer, Engine};
pub use builder::CircuitBuilder;
pub use circuit::{
    CallOptions, CircuitBreaker, CircuitState, Config, FallbackCause, FallbackContext, Metrics,
};
pub use classifier::{DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use decorate::GuardedStream;
pub use errors::{CallNotPermitted, CircuitError, ConfigError};
pub use events::{BreakerEvent, BreakerEventKind, EventPublisher, EventStream};
pub use metrics::{MetricsPublisher, MetricsSink, RecorderSink};
pub use permits::Permit;
pub use registry::{Registry, RegistryConfig};
pub use settings::{BreakerSettings, RegistrySettings};
pub use window::{CountWindow, OutcomeWindow, SlidingWindowType, TimeWindow, WindowSnapshot};

/// Classification of a finished call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    Success,
    Failure,
    SlowSuccess,
    SlowFailure,
}

impl OutcomeKind {
    /// Failed calls, slow or not
    pub fn is_failure(self) -> bool {
        matches!(self, OutcomeKind::Failure | OutcomeKind::SlowFailure)
    }

    /// Calls slower than the slow-call threshold
    pub fn is_slow(self) -> bool {
        matches!(self, OutcomeKind::SlowSuccess | OutcomeKind::SlowFailure)
    }
}

/// A single finished call recorded by the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallOutcome {
    pub kind: OutcomeKind,
    pub duration: Duration,
}
