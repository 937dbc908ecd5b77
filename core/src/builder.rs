//! Builder API for ergonomic circuit breaker configuration

use crate::{
    circuit::{CircuitBreaker, Config},
    classifier::FailureClassifier,
    clock::{Clock, MonotonicClock},
    errors::ConfigError,
    events::EventPublisher,
    window::SlidingWindowType,
};
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating circuit breakers with fluent API
pub struct CircuitBuilder {
    name: String,
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    events: Option<EventPublisher>,
}

impl CircuitBuilder {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Config::default(),
            clock: None,
            failure_classifier: None,
            events: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the failure rate threshold in percent (0-100)
    /// Circuit opens when failed / buffered calls * 100 >= this value
    pub fn failure_rate_threshold(mut self, percent: f32) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    /// Set the slow-call rate threshold in percent (0-100)
    pub fn slow_call_rate_threshold(mut self, percent: f32) -> Self {
        self.config.slow_call_rate_threshold = percent;
        self
    }

    /// Calls running longer than this are recorded as slow
    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    /// Keep the last `size` calls in the window
    pub fn count_based_window(mut self, size: usize) -> Self {
        self.config.sliding_window_type = SlidingWindowType::CountBased;
        self.config.sliding_window_size = size;
        self
    }

    /// Keep the calls of the last `seconds` in the window
    pub fn time_based_window(mut self, seconds: usize) -> Self {
        self.config.sliding_window_type = SlidingWindowType::TimeBased;
        self.config.sliding_window_size = seconds;
        self
    }

    /// Set the window size without changing its type
    pub fn sliding_window_size(mut self, size: usize) -> Self {
        self.config.sliding_window_size = size;
        self
    }

    /// Set minimum number of calls before rates are evaluated
    pub fn minimum_number_of_calls(mut self, calls: usize) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    /// Set how long the circuit stays open before trial calls
    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.config.wait_duration_in_open_state = wait;
        self
    }

    /// Set the number of trial calls admitted while half-open
    pub fn permitted_calls_in_half_open_state(mut self, calls: usize) -> Self {
        self.config.permitted_calls_in_half_open_state = calls;
        self
    }

    /// Enable or disable the lazy Open -> HalfOpen transition
    pub fn automatic_transition_from_open_to_half_open(mut self, enabled: bool) -> Self {
        self.config.automatic_transition_from_open_to_half_open = enabled;
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: wait * (1 - jitter + rand * jitter)
    pub fn wait_jitter_factor(mut self, factor: f64) -> Self {
        self.config.wait_jitter_factor = factor;
        self
    }

    /// Bound async calls; a timeout counts as a failure
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    /// Use a custom time source
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set a failure classifier to filter which errors are recorded
    ///
    /// Use this to ignore "expected" errors like validation failures or client
    /// errors (4xx), while still recording server errors (5xx).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use breaker_engine::{CircuitBreaker, PredicateClassifier};
    /// use std::sync::Arc;
    ///
    /// let circuit = CircuitBreaker::builder("api")
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
    ///         ctx.error.downcast_ref::<&str>() != Some(&"not found")
    ///     })))
    ///     .build()
    ///     .unwrap();
    /// # assert!(circuit.is_closed());
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Publish events into a shared publisher instead of a private one
    pub fn event_publisher(mut self, events: EventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the circuit breaker, validating the configuration
    pub fn build(self) -> Result<CircuitBreaker, ConfigError> {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));

        CircuitBreaker::from_parts(
            self.name,
            self.config,
            clock,
            self.failure_classifier,
            self.events.unwrap_or_default(),
        )
    }
}
