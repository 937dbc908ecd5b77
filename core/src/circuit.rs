//! Circuit breaker implementation using state machines
//!
//! The lifecycle lives in a `state_machines` dynamic machine. `CircuitBreaker`
//! wraps it in a mutex so a single writer at a time drives transitions, and
//! mirrors the current state into an atomic for lock-free reads.

use crate::{
    CallOutcome, OutcomeKind,
    classifier::{FailureClassifier, FailureContext},
    clock::{Clock, MonotonicClock},
    errors::{CallNotPermitted, CircuitError, ConfigError},
    events::{BreakerEventKind, EventPublisher, EventStream},
    permits::{HalfOpenPermits, Permit},
    window::{CountWindow, OutcomeWindow, SlidingWindowType, WindowSnapshot, build_window},
};
use parking_lot::Mutex;
use state_machines::state_machine;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Failure percentage (0-100) at or above which the circuit opens
    pub failure_rate_threshold: f32,

    /// Slow-call percentage (0-100) at or above which the circuit opens
    pub slow_call_rate_threshold: f32,

    /// Calls running longer than this count as slow
    pub slow_call_duration_threshold: Duration,

    /// Whether the window counts calls or seconds
    pub sliding_window_type: SlidingWindowType,

    /// Calls (count-based) or seconds (time-based) kept in the window
    pub sliding_window_size: usize,

    /// Minimum number of buffered calls before rates are evaluated
    pub minimum_number_of_calls: usize,

    /// How long the circuit stays open before admitting trial calls
    pub wait_duration_in_open_state: Duration,

    /// Trial calls admitted while half-open
    pub permitted_calls_in_half_open_state: usize,

    /// Move Open -> HalfOpen on the first call after the wait elapsed
    pub automatic_transition_from_open_to_half_open: bool,

    /// Jitter factor for the open wait (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: wait * (1 - jitter + rand * jitter)
    pub wait_jitter_factor: f64,

    /// Upper bound for async calls; `None` lets them run indefinitely
    pub call_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 100,
            minimum_number_of_calls: 100,
            wait_duration_in_open_state: Duration::from_secs(60),
            permitted_calls_in_half_open_state: 10,
            automatic_transition_from_open_to_half_open: true,
            wait_jitter_factor: 0.0,
            call_timeout: None,
        }
    }
}

impl Config {
    /// Reject configurations the state machine cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.failure_rate_threshold) {
            return Err(ConfigError::invalid(
                "failure_rate_threshold",
                format!("must be within 0..=100, got {}", self.failure_rate_threshold),
            ));
        }
        if !(0.0..=100.0).contains(&self.slow_call_rate_threshold) {
            return Err(ConfigError::invalid(
                "slow_call_rate_threshold",
                format!("must be within 0..=100, got {}", self.slow_call_rate_threshold),
            ));
        }
        if self.sliding_window_size == 0 {
            return Err(ConfigError::invalid("sliding_window_size", "must be greater than 0"));
        }
        if self.minimum_number_of_calls == 0 {
            return Err(ConfigError::invalid(
                "minimum_number_of_calls",
                "must be greater than 0",
            ));
        }
        if self.permitted_calls_in_half_open_state == 0 {
            return Err(ConfigError::invalid(
                "permitted_calls_in_half_open_state",
                "must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.wait_jitter_factor) {
            return Err(ConfigError::invalid(
                "wait_jitter_factor",
                format!("must be within 0..=1, got {}", self.wait_jitter_factor),
            ));
        }
        if self.call_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::invalid("call_timeout", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Externally visible circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
    Disabled = 3,
    ForcedOpen = 4,
}

impl CircuitState {
    pub const ALL: [CircuitState; 5] = [
        CircuitState::Closed,
        CircuitState::Open,
        CircuitState::HalfOpen,
        CircuitState::Disabled,
        CircuitState::ForcedOpen,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
            CircuitState::Disabled => "Disabled",
            CircuitState::ForcedOpen => "ForcedOpen",
        }
    }

    fn from_machine(state: &str) -> Self {
        match state {
            "Open" => CircuitState::Open,
            "HalfOpen" => CircuitState::HalfOpen,
            "Disabled" => CircuitState::Disabled,
            "ForcedOpen" => CircuitState::ForcedOpen,
            other => {
                debug_assert_eq!(other, "Closed", "unknown machine state");
                CircuitState::Closed
            }
        }
    }

    fn from_u8(value: u8) -> Self {
        Self::ALL
            .get(value as usize)
            .copied()
            .unwrap_or(CircuitState::Closed)
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a fallback was invoked
#[derive(Debug)]
pub enum FallbackCause<E> {
    /// The circuit rejected the call
    NotPermitted(CallNotPermitted),
    /// The operation ran and failed
    Failed(E),
    /// The async operation exceeded the call timeout
    TimedOut(Duration),
}

/// Context handed to fallback closures
#[derive(Debug)]
pub struct FallbackContext<E> {
    /// Circuit name
    pub circuit_name: String,
    /// Circuit state when the fallback ran
    pub state: CircuitState,
    pub cause: FallbackCause<E>,
}

/// Type alias for fallback function
pub type FallbackFn<T, E> = Box<dyn FnOnce(FallbackContext<E>) -> Result<T, E> + Send>;

/// Options for circuit breaker calls
pub struct CallOptions<T, E> {
    /// Optional fallback used when the call is rejected or fails
    pub fallback: Option<FallbackFn<T, E>>,
}

impl<T, E> Default for CallOptions<T, E> {
    fn default() -> Self {
        Self { fallback: None }
    }
}

impl<T, E> CallOptions<T, E> {
    /// Create new call options with no fallback
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a fallback function
    pub fn with_fallback<F>(mut self, f: F) -> Self
    where
        F: FnOnce(FallbackContext<E>) -> Result<T, E> + Send + 'static,
    {
        self.fallback = Some(Box::new(f));
        self
    }
}

/// Type alias for callable function
pub type CallableFn<T, E> = Box<dyn FnOnce() -> Result<T, E>>;

/// Trait for converting into CallOptions - allows flexible call() API
pub trait IntoCallOptions<T, E> {
    fn into_call_options(self) -> (CallableFn<T, E>, CallOptions<T, E>);
}

/// Plain closures run without a fallback
impl<T, E, F> IntoCallOptions<T, E> for F
where
    F: FnOnce() -> Result<T, E> + 'static,
{
    fn into_call_options(self) -> (CallableFn<T, E>, CallOptions<T, E>) {
        (Box::new(self), CallOptions::default())
    }
}

impl<T, E, F> IntoCallOptions<T, E> for (F, CallOptions<T, E>)
where
    F: FnOnce() -> Result<T, E> + 'static,
{
    fn into_call_options(self) -> (CallableFn<T, E>, CallOptions<T, E>) {
        (Box::new(self.0), self.1)
    }
}

/// Circuit breaker context - shared data across all states
#[derive(Clone)]
pub struct CircuitContext {
    pub name: String,
    pub config: Config,
    pub window: Arc<dyn OutcomeWindow>,
    pub clock: Arc<dyn Clock>,
}

impl Default for CircuitContext {
    fn default() -> Self {
        let config = Config::default();
        Self {
            name: String::new(),
            window: Arc::new(CountWindow::new(config.sliding_window_size)),
            config,
            clock: Arc::new(MonotonicClock::new()),
        }
    }
}

impl fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitContext")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("window", &self.window)
            .field("clock", &self.clock)
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at: f64,
    /// Effective wait for this opening, jitter included
    pub wait_secs: f64,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    /// Outcomes of the trial calls of this round
    pub tally: WindowSnapshot,
}

// Define the circuit breaker state machine with dynamic mode
state_machine! {
    name: Breaker,
    context: CircuitContext,
    dynamic: true,  // Enable dynamic mode for runtime state transitions

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
        Disabled,
        ForcedOpen,
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [wait_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
        open_manually {
            transition: { from: [Closed, HalfOpen, Disabled, ForcedOpen], to: Open }
        }
        half_open_manually {
            transition: { from: [Closed, Open, Disabled, ForcedOpen], to: HalfOpen }
        }
        disable {
            transition: { from: [Closed, Open, HalfOpen, ForcedOpen], to: Disabled }
        }
        force_open {
            transition: { from: [Closed, Open, HalfOpen, Disabled], to: ForcedOpen }
        }
    }
}

/// Whether either rate crossed its threshold; undefined rates never breach
fn rates_breached(counts: &WindowSnapshot, config: &Config, minimum_calls: usize) -> bool {
    let failure_rate = counts.failure_rate(minimum_calls);
    let slow_call_rate = counts.slow_call_rate(minimum_calls);

    (failure_rate >= 0.0 && failure_rate >= config.failure_rate_threshold)
        || (slow_call_rate >= 0.0 && slow_call_rate >= config.slow_call_rate_threshold)
}

// Guards for dynamic mode - implemented on typestate machines
impl Breaker<Closed> {
    /// Check the sliding window once enough calls are buffered
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        rates_breached(
            &ctx.window.snapshot(),
            &ctx.config,
            ctx.config.minimum_number_of_calls,
        )
    }
}

impl Breaker<HalfOpen> {
    /// Check the trial calls once the whole quota has reported
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        let quota = ctx.config.permitted_calls_in_half_open_state;
        self.state_data_half_open()
            .is_some_and(|data| rates_breached(&data.tally, &ctx.config, quota))
    }

    /// Close once the whole quota reported without a breach
    fn should_close(&self, ctx: &CircuitContext) -> bool {
        let quota = ctx.config.permitted_calls_in_half_open_state;
        self.state_data_half_open().is_some_and(|data| {
            data.tally.total() >= quota && !rates_breached(&data.tally, &ctx.config, quota)
        })
    }
}

impl Breaker<Open> {
    /// Check if the wait has elapsed for Open -> HalfOpen transition
    fn wait_elapsed(&self, ctx: &CircuitContext) -> bool {
        self.state_data_open()
            .is_some_and(|data| ctx.clock.monotonic_time() - data.opened_at >= data.wait_secs)
    }
}

/// Read-only view of a circuit for metrics exporters
#[derive(Debug, Clone, PartialEq)]
pub struct Metrics {
    pub state: CircuitState,
    pub successful_calls: usize,
    pub failed_calls: usize,
    pub slow_successful_calls: usize,
    pub slow_failed_calls: usize,
    pub buffered_calls: usize,
    /// Percentage, or -1.0 below the minimum number of calls
    pub failure_rate: f32,
    /// Percentage, or -1.0 below the minimum number of calls
    pub slow_call_rate: f32,
    /// Rejected calls since the circuit was created
    pub not_permitted_calls: u64,
}

/// Circuit breaker public API
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct CircuitBreaker {
    machine: Mutex<DynamicBreaker>,
    state: AtomicU8,
    context: CircuitContext,
    permits: Arc<HalfOpenPermits>,
    not_permitted: AtomicU64,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    events: EventPublisher,
}

impl CircuitBreaker {
    /// Create a new circuit breaker (use builder() for more options)
    pub fn new(name: impl Into<String>, config: Config) -> Result<Self, ConfigError> {
        Self::from_parts(
            name.into(),
            config,
            Arc::new(MonotonicClock::new()),
            None,
            EventPublisher::new(),
        )
    }

    /// Create a circuit breaker from its collaborators (used by builder)
    pub(crate) fn from_parts(
        name: String,
        config: Config,
        clock: Arc<dyn Clock>,
        failure_classifier: Option<Arc<dyn FailureClassifier>>,
        events: EventPublisher,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let window = build_window(
            config.sliding_window_type,
            config.sliding_window_size,
            clock.clone(),
        );
        let context = CircuitContext {
            name,
            config,
            window,
            clock,
        };

        Ok(Self {
            machine: Mutex::new(DynamicBreaker::new(context.clone())),
            state: AtomicU8::new(CircuitState::Closed as u8),
            context,
            permits: Arc::new(HalfOpenPermits::new()),
            not_permitted: AtomicU64::new(0),
            failure_classifier,
            events,
        })
    }

    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn config(&self) -> &Config {
        &self.context.config
    }

    /// Current state, read without taking the machine lock
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Get current state name
    pub fn state_name(&self) -> &'static str {
        self.state().as_str()
    }

    /// Check if circuit is open
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Check if circuit is closed
    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Receive every event this circuit publishes from now on
    ///
    /// The stream is unbounded: each call queues at least one event until it
    /// is received, so a stream that is kept but never read grows without
    /// limit. Drop it when done.
    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Ask for admission of one call
    ///
    /// Closed and Disabled always admit. Open rejects until the wait has
    /// elapsed (and automatic transition is on), then moves to HalfOpen.
    /// HalfOpen admits while trial permits remain. ForcedOpen always rejects.
    pub fn try_acquire_permission(&self) -> Result<Permit, CallNotPermitted> {
        match self.state() {
            CircuitState::Closed | CircuitState::Disabled => return Ok(Permit::unrestricted()),
            CircuitState::ForcedOpen => return Err(self.reject(CircuitState::ForcedOpen)),
            CircuitState::Open | CircuitState::HalfOpen => {}
        }

        let mut machine = self.machine.lock();

        if machine.current_state() == "Open"
            && self.context.config.automatic_transition_from_open_to_half_open
        {
            self.fire(&mut machine, BreakerEvent::AttemptReset);
        }

        match CircuitState::from_machine(machine.current_state()) {
            CircuitState::Closed | CircuitState::Disabled => Ok(Permit::unrestricted()),
            CircuitState::HalfOpen => match self.permits.try_acquire() {
                Some(generation) => Ok(Permit::half_open(self.permits.clone(), generation)),
                None => Err(self.reject(CircuitState::HalfOpen)),
            },
            state => Err(self.reject(state)),
        }
    }

    /// Report a call that completed normally
    pub fn on_success(&self, permit: Permit, duration: Duration) {
        let kind = if self.is_slow(duration) {
            OutcomeKind::SlowSuccess
        } else {
            OutcomeKind::Success
        };
        self.publish(BreakerEventKind::Success { elapsed: duration });
        self.record(permit, CallOutcome { kind, duration });
    }

    /// Report a failed call, letting the failure classifier ignore it
    pub fn on_error<E: 'static>(&self, permit: Permit, duration: Duration, error: &E) {
        if !self.should_record(error, duration) {
            debug!(circuit = %self.context.name, "Error ignored by failure classifier");
            self.publish(BreakerEventKind::IgnoredError { elapsed: duration });
            // Dropping the permit hands a half-open slot back
            drop(permit);
            return;
        }
        self.on_failure(permit, duration);
    }

    /// Report a failed call unconditionally
    pub fn on_failure(&self, permit: Permit, duration: Duration) {
        let kind = if self.is_slow(duration) {
            OutcomeKind::SlowFailure
        } else {
            OutcomeKind::Failure
        };
        self.publish(BreakerEventKind::Error { elapsed: duration });
        self.record(permit, CallOutcome { kind, duration });
    }

    /// Report an async call that exceeded `call_timeout`
    pub(crate) fn on_timeout(&self, permit: Permit, after: Duration) {
        warn!(circuit = %self.context.name, ?after, "Guarded call timed out");
        self.publish(BreakerEventKind::Timeout { after });
        self.on_failure(permit, after);
    }

    /// Execute a fallible operation with circuit breaker protection
    ///
    /// Accepts either:
    /// - A plain closure: `circuit.call(|| api_request())`
    /// - A closure with options: `circuit.call((|| api_request(), CallOptions::new().with_fallback(...)))`
    pub fn call<I, T, E: 'static>(&self, input: I) -> Result<T, CircuitError<E>>
    where
        I: IntoCallOptions<T, E>,
    {
        let (f, options) = input.into_call_options();

        let permit = match self.try_acquire_permission() {
            Ok(permit) => permit,
            Err(rejected) => {
                return self.recover(options.fallback, FallbackCause::NotPermitted(rejected));
            }
        };

        let start = self.context.clock.monotonic_time();
        match f() {
            Ok(value) => {
                self.on_success(permit, self.elapsed_since(start));
                Ok(value)
            }
            Err(e) => {
                self.on_error(permit, self.elapsed_since(start), &e);
                self.recover(options.fallback, FallbackCause::Failed(e))
            }
        }
    }

    /// Run the fallback if there is one, otherwise surface the cause as an error
    pub(crate) fn recover<T, E>(
        &self,
        fallback: Option<FallbackFn<T, E>>,
        cause: FallbackCause<E>,
    ) -> Result<T, CircuitError<E>> {
        match fallback {
            Some(fallback) => fallback(FallbackContext {
                circuit_name: self.context.name.clone(),
                state: self.state(),
                cause,
            })
            .map_err(CircuitError::Execution),
            None => Err(match cause {
                FallbackCause::NotPermitted(rejected) => CircuitError::NotPermitted(rejected),
                FallbackCause::Failed(e) => CircuitError::Execution(e),
                FallbackCause::TimedOut(after) => CircuitError::Timeout {
                    circuit: self.context.name.clone(),
                    after,
                },
            }),
        }
    }

    /// Administratively open the circuit and restart its wait
    pub fn transition_to_open_state(&self) {
        self.transition_manually(CircuitState::Open);
    }

    /// Administratively close the circuit with an empty window
    pub fn transition_to_closed_state(&self) {
        self.transition_manually(CircuitState::Closed);
    }

    /// Administratively start a new half-open round
    pub fn transition_to_half_open_state(&self) {
        self.transition_manually(CircuitState::HalfOpen);
    }

    /// Admit every call and stop recording outcomes
    pub fn transition_to_disabled_state(&self) {
        self.transition_manually(CircuitState::Disabled);
    }

    /// Reject every call until another manual transition
    pub fn transition_to_forced_open_state(&self) {
        self.transition_manually(CircuitState::ForcedOpen);
    }

    /// Clear all events and reset circuit to Closed state
    pub fn reset(&self) {
        let mut machine = self.machine.lock();
        self.context.window.reset();
        // Recreate machine in Closed state
        *machine = DynamicBreaker::new(self.context.clone());
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        info!(circuit = %self.context.name, "Circuit reset");
        self.publish(BreakerEventKind::Reset);
    }

    /// Snapshot of the current counters; never blocks on in-flight calls
    ///
    /// While half-open the counts are those of the running trial round, and
    /// rates are defined once the whole quota has reported.
    pub fn metrics(&self) -> Metrics {
        let (state, counts, minimum_calls) = match self.state() {
            CircuitState::HalfOpen => {
                let mut machine = self.machine.lock();
                match machine.half_open_data_mut() {
                    Some(data) => (
                        CircuitState::HalfOpen,
                        data.tally,
                        self.context.config.permitted_calls_in_half_open_state,
                    ),
                    None => (
                        CircuitState::from_machine(machine.current_state()),
                        self.context.window.snapshot(),
                        self.context.config.minimum_number_of_calls,
                    ),
                }
            }
            state => (
                state,
                self.context.window.snapshot(),
                self.context.config.minimum_number_of_calls,
            ),
        };

        Metrics {
            state,
            successful_calls: counts.successes,
            failed_calls: counts.failures,
            slow_successful_calls: counts.slow_successes,
            slow_failed_calls: counts.slow_failures,
            buffered_calls: counts.total(),
            failure_rate: counts.failure_rate(minimum_calls),
            slow_call_rate: counts.slow_call_rate(minimum_calls),
            not_permitted_calls: self.not_permitted.load(Ordering::Acquire),
        }
    }

    pub(crate) fn monotonic_time(&self) -> f64 {
        self.context.clock.monotonic_time()
    }

    pub(crate) fn elapsed_since(&self, start: f64) -> Duration {
        Duration::from_secs_f64((self.monotonic_time() - start).max(0.0))
    }

    fn is_slow(&self, duration: Duration) -> bool {
        duration > self.context.config.slow_call_duration_threshold
    }

    fn should_record<E: 'static>(&self, error: &E, duration: Duration) -> bool {
        match &self.failure_classifier {
            Some(classifier) => classifier.should_record(&FailureContext {
                circuit_name: &self.context.name,
                error: error as &dyn std::any::Any,
                duration,
            }),
            None => true,
        }
    }

    /// Feed a finished call into the machine and evaluate transitions
    fn record(&self, permit: Permit, outcome: CallOutcome) {
        let mut machine = self.machine.lock();
        let generation = permit.consume();

        match CircuitState::from_machine(machine.current_state()) {
            CircuitState::Closed => {
                self.context.window.record(outcome);
                self.fire(&mut machine, BreakerEvent::Trip);
            }
            CircuitState::HalfOpen => {
                // Only trial calls of the running round count
                if generation != Some(self.permits.generation()) {
                    return;
                }
                if let Some(data) = machine.half_open_data_mut() {
                    data.tally.add(outcome.kind);
                }
                if !self.fire(&mut machine, BreakerEvent::Trip) {
                    self.fire(&mut machine, BreakerEvent::Close);
                }
            }
            CircuitState::Open | CircuitState::Disabled | CircuitState::ForcedOpen => {}
        }
    }

    fn transition_manually(&self, target: CircuitState) {
        let mut machine = self.machine.lock();
        let from = CircuitState::from_machine(machine.current_state());

        if from == target {
            // Already there: restart the state instead of transitioning
            self.enter_state(&mut machine, target);
            return;
        }

        match target {
            CircuitState::Closed => {
                *machine = DynamicBreaker::new(self.context.clone());
                self.after_transition(&mut machine, from, CircuitState::Closed);
            }
            CircuitState::Open => {
                self.fire(&mut machine, BreakerEvent::OpenManually);
            }
            CircuitState::HalfOpen => {
                self.fire(&mut machine, BreakerEvent::HalfOpenManually);
            }
            CircuitState::Disabled => {
                self.fire(&mut machine, BreakerEvent::Disable);
            }
            CircuitState::ForcedOpen => {
                self.fire(&mut machine, BreakerEvent::ForceOpen);
            }
        }
    }

    /// Handle an event; returns whether a transition happened
    fn fire(&self, machine: &mut DynamicBreaker, event: BreakerEvent) -> bool {
        let from = CircuitState::from_machine(machine.current_state());
        if machine.handle(event).is_err() {
            return false;
        }

        let to = CircuitState::from_machine(machine.current_state());
        self.after_transition(machine, from, to);
        true
    }

    fn after_transition(&self, machine: &mut DynamicBreaker, from: CircuitState, to: CircuitState) {
        self.enter_state(machine, to);

        if to == CircuitState::Open {
            warn!(circuit = %self.context.name, %from, "Circuit opened");
        } else {
            info!(circuit = %self.context.name, %from, %to, "Circuit state transition");
        }
        self.publish(BreakerEventKind::StateTransition { from, to });
    }

    /// Entry bookkeeping for a state: timestamps, window, trial quota
    fn enter_state(&self, machine: &mut DynamicBreaker, state: CircuitState) {
        match state {
            CircuitState::Open => {
                let opened_at = self.monotonic_time();
                let wait_secs = self.open_wait_secs();
                if let Some(data) = machine.open_data_mut() {
                    data.opened_at = opened_at;
                    data.wait_secs = wait_secs;
                }
                self.context.window.reset();
            }
            CircuitState::HalfOpen => {
                if let Some(data) = machine.half_open_data_mut() {
                    data.tally = WindowSnapshot::default();
                }
                self.permits
                    .reset(self.context.config.permitted_calls_in_half_open_state);
            }
            CircuitState::Closed | CircuitState::Disabled | CircuitState::ForcedOpen => {
                self.context.window.reset();
            }
        }
        self.state.store(state as u8, Ordering::Release);
    }

    /// Wait before admitting trial calls, with chrono-machines jitter when configured
    fn open_wait_secs(&self) -> f64 {
        let config = &self.context.config;
        if config.wait_jitter_factor > 0.0 {
            let wait_ms = config.wait_duration_in_open_state.as_millis() as u64;
            let policy = chrono_machines::Policy {
                max_attempts: 1,
                base_delay_ms: wait_ms,
                multiplier: 1.0,
                max_delay_ms: wait_ms,
            };
            let delay_ms = policy.calculate_delay(1, config.wait_jitter_factor);
            (delay_ms as f64) / 1000.0
        } else {
            config.wait_duration_in_open_state.as_secs_f64()
        }
    }

    fn reject(&self, state: CircuitState) -> CallNotPermitted {
        self.not_permitted.fetch_add(1, Ordering::AcqRel);
        debug!(circuit = %self.context.name, %state, "Call not permitted");
        self.publish(BreakerEventKind::NotPermitted);
        CallNotPermitted {
            circuit: self.context.name.clone(),
            state,
        }
    }

    fn publish(&self, kind: BreakerEventKind) {
        self.events
            .publish(&self.context.name, kind, self.monotonic_time());
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.context.name)
            .field("state", &self.state())
            .field("config", &self.context.config)
            .field("not_permitted", &self.not_permitted.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ManualClock, PredicateClassifier};
    use std::thread;

    fn circuit_with_clock(
        builder: crate::builder::CircuitBuilder,
    ) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let circuit = builder.clock(clock.clone()).build().unwrap();
        (circuit, clock)
    }

    fn succeed(circuit: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        circuit.call(|| Ok(()))
    }

    fn fail(circuit: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        circuit.call(|| Err("boom"))
    }

    #[test]
    fn test_opens_on_failure_rate_and_recovers_after_wait() {
        let (circuit, clock) = circuit_with_clock(
            CircuitBreaker::builder("checkout")
                .failure_rate_threshold(50.0)
                .minimum_number_of_calls(4)
                .count_based_window(4)
                .wait_duration_in_open_state(Duration::from_secs(10))
                .permitted_calls_in_half_open_state(1),
        );

        succeed(&circuit).unwrap();
        succeed(&circuit).unwrap();
        assert!(fail(&circuit).is_err());
        assert!(circuit.is_closed(), "below minimum number of calls");
        assert!(fail(&circuit).is_err());
        assert!(circuit.is_open());
        assert_eq!(circuit.metrics().buffered_calls, 0, "window reset on open");

        let rejected = succeed(&circuit).unwrap_err();
        assert!(rejected.is_not_permitted());
        assert_eq!(circuit.metrics().not_permitted_calls, 1);

        clock.advance(Duration::from_secs(10));
        succeed(&circuit).unwrap();
        assert!(circuit.is_closed());
    }

    #[test]
    fn test_below_threshold_never_opens() {
        let circuit = CircuitBreaker::builder("steady")
            .failure_rate_threshold(50.0)
            .minimum_number_of_calls(4)
            .count_based_window(4)
            .build()
            .unwrap();

        for _ in 0..25 {
            succeed(&circuit).unwrap();
            succeed(&circuit).unwrap();
            succeed(&circuit).unwrap();
            let _ = fail(&circuit);
            assert!(circuit.is_closed());
        }
        assert_eq!(circuit.metrics().failure_rate, 25.0);
    }

    #[test]
    fn test_slow_calls_open_circuit() {
        let circuit = CircuitBreaker::builder("sluggish")
            .slow_call_rate_threshold(50.0)
            .slow_call_duration_threshold(Duration::from_millis(100))
            .minimum_number_of_calls(2)
            .count_based_window(2)
            .build()
            .unwrap();

        let permit = circuit.try_acquire_permission().unwrap();
        circuit.on_success(permit, Duration::from_millis(50));
        let permit = circuit.try_acquire_permission().unwrap();
        circuit.on_success(permit, Duration::from_millis(250));

        assert!(circuit.is_open());
    }

    #[test]
    fn test_slow_failures_counted_in_both_rates() {
        let circuit = CircuitBreaker::builder("metrics")
            .slow_call_duration_threshold(Duration::from_millis(100))
            .minimum_number_of_calls(10)
            .build()
            .unwrap();

        let permit = circuit.try_acquire_permission().unwrap();
        circuit.on_failure(permit, Duration::from_millis(500));
        let permit = circuit.try_acquire_permission().unwrap();
        circuit.on_success(permit, Duration::from_millis(1));

        let metrics = circuit.metrics();
        assert_eq!(metrics.slow_failed_calls, 1);
        assert_eq!(metrics.successful_calls, 1);
        assert_eq!(metrics.buffered_calls, 2);
        assert_eq!(metrics.failure_rate, -1.0);
        assert_eq!(metrics.slow_call_rate, -1.0);
    }

    #[test]
    fn test_open_admits_exactly_quota_after_wait() {
        let (circuit, clock) = circuit_with_clock(
            CircuitBreaker::builder("trial")
                .wait_duration_in_open_state(Duration::from_secs(30))
                .permitted_calls_in_half_open_state(3),
        );
        circuit.transition_to_open_state();

        clock.advance(Duration::from_secs(29));
        assert!(circuit.try_acquire_permission().is_err());
        assert!(circuit.is_open());

        clock.advance(Duration::from_secs(1));
        let permits: Vec<_> = (0..5)
            .filter_map(|_| circuit.try_acquire_permission().ok())
            .collect();
        assert_eq!(permits.len(), 3);
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (circuit, _clock) = circuit_with_clock(
            CircuitBreaker::builder("flaky")
                .failure_rate_threshold(50.0)
                .permitted_calls_in_half_open_state(2),
        );
        circuit.transition_to_half_open_state();

        let first = circuit.try_acquire_permission().unwrap();
        let second = circuit.try_acquire_permission().unwrap();
        assert!(circuit.try_acquire_permission().is_err());

        circuit.on_success(first, Duration::from_millis(5));
        assert_eq!(circuit.state(), CircuitState::HalfOpen, "quota not complete");

        circuit.on_failure(second, Duration::from_millis(5));
        assert!(circuit.is_open());
    }

    #[test]
    fn test_half_open_successes_close() {
        let (circuit, _clock) = circuit_with_clock(
            CircuitBreaker::builder("healing")
                .minimum_number_of_calls(50)
                .permitted_calls_in_half_open_state(2),
        );
        circuit.transition_to_half_open_state();

        for _ in 0..2 {
            let permit = circuit.try_acquire_permission().unwrap();
            circuit.on_success(permit, Duration::from_millis(1));
        }

        assert!(circuit.is_closed());
        assert_eq!(circuit.metrics().buffered_calls, 0);
    }

    #[test]
    fn test_metrics_report_half_open_round() {
        let (circuit, _clock) = circuit_with_clock(
            CircuitBreaker::builder("tally")
                .minimum_number_of_calls(2)
                .count_based_window(2)
                .permitted_calls_in_half_open_state(3),
        );
        for _ in 0..2 {
            let _ = circuit.call(|| Err::<(), _>("down"));
        }
        assert!(circuit.is_open());
        circuit.transition_to_half_open_state();

        let first = circuit.try_acquire_permission().unwrap();
        let second = circuit.try_acquire_permission().unwrap();
        circuit.on_success(first, Duration::from_millis(1));
        circuit.on_failure(second, Duration::from_millis(1));

        let metrics = circuit.metrics();
        assert_eq!(metrics.state, CircuitState::HalfOpen);
        assert_eq!(metrics.successful_calls, 1);
        assert_eq!(metrics.failed_calls, 1);
        assert_eq!(metrics.buffered_calls, 2);
        assert_eq!(metrics.failure_rate, -1.0, "quota not complete");

        let third = circuit.try_acquire_permission().unwrap();
        circuit.on_success(third, Duration::from_millis(1));
        assert!(circuit.is_closed());
    }

    #[test]
    fn test_stale_half_open_permit_ignored() {
        let (circuit, _clock) = circuit_with_clock(
            CircuitBreaker::builder("rounds").permitted_calls_in_half_open_state(1),
        );
        circuit.transition_to_half_open_state();
        let stale = circuit.try_acquire_permission().unwrap();

        // Start a fresh round
        circuit.transition_to_half_open_state();
        circuit.on_failure(stale, Duration::from_millis(1));
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        let permit = circuit.try_acquire_permission().unwrap();
        assert!(circuit.try_acquire_permission().is_err());
        circuit.on_success(permit, Duration::from_millis(1));
        assert!(circuit.is_closed());
    }

    #[test]
    fn test_outcomes_ignored_while_open() {
        let circuit = CircuitBreaker::builder("late").build().unwrap();
        let permit = circuit.try_acquire_permission().unwrap();

        circuit.transition_to_open_state();
        circuit.on_failure(permit, Duration::from_millis(1));

        assert!(circuit.is_open());
        assert_eq!(circuit.metrics().buffered_calls, 0);
    }

    #[test]
    fn test_automatic_transition_disabled() {
        let (circuit, clock) = circuit_with_clock(
            CircuitBreaker::builder("manual")
                .wait_duration_in_open_state(Duration::from_secs(1))
                .automatic_transition_from_open_to_half_open(false),
        );
        circuit.transition_to_open_state();

        clock.advance(Duration::from_secs(120));
        assert!(circuit.try_acquire_permission().is_err());
        assert!(circuit.is_open());

        circuit.transition_to_half_open_state();
        assert!(circuit.try_acquire_permission().is_ok());
    }

    #[test]
    fn test_jitter_never_extends_wait() {
        for _ in 0..20 {
            let (circuit, clock) = circuit_with_clock(
                CircuitBreaker::builder("jittered")
                    .wait_duration_in_open_state(Duration::from_secs(10))
                    .wait_jitter_factor(1.0),
            );
            circuit.transition_to_open_state();

            clock.advance(Duration::from_secs(10));
            assert!(circuit.try_acquire_permission().is_ok());
        }
    }

    #[test]
    fn test_fallback_on_rejection() {
        let circuit = CircuitBreaker::builder("fallback").build().unwrap();
        circuit.transition_to_forced_open_state();

        let result = circuit.call((
            || Ok::<_, String>(1),
            CallOptions::new().with_fallback(|ctx| {
                assert_eq!(ctx.circuit_name, "fallback");
                assert_eq!(ctx.state, CircuitState::ForcedOpen);
                match ctx.cause {
                    FallbackCause::NotPermitted(_) => Ok(42),
                    _ => Err("unexpected cause".to_string()),
                }
            }),
        ));

        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_fallback_on_failure_still_records() {
        let circuit = CircuitBreaker::builder("masked")
            .minimum_number_of_calls(1)
            .count_based_window(1)
            .build()
            .unwrap();

        let result = circuit.call((
            || Err::<u32, _>("down"),
            CallOptions::new().with_fallback(|_| Ok(0)),
        ));

        assert_eq!(result.unwrap(), 0);
        assert!(circuit.is_open());
    }

    #[test]
    fn test_classifier_ignores_expected_errors() {
        let circuit = CircuitBreaker::builder("lookup")
            .minimum_number_of_calls(1)
            .count_based_window(1)
            .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
                ctx.error.downcast_ref::<&str>() != Some(&"not found")
            })))
            .build()
            .unwrap();
        let mut events = circuit.subscribe();

        let result = circuit.call(|| Err::<(), _>("not found"));
        assert!(matches!(result, Err(CircuitError::Execution("not found"))));
        assert!(circuit.is_closed());
        assert_eq!(circuit.metrics().buffered_calls, 0);
        assert!(matches!(
            events.try_recv().map(|e| e.kind),
            Some(BreakerEventKind::IgnoredError { .. })
        ));

        let _ = circuit.call(|| Err::<(), _>("server error"));
        assert!(circuit.is_open());
    }

    #[test]
    fn test_ignored_error_returns_half_open_permit() {
        let (circuit, _clock) = circuit_with_clock(
            CircuitBreaker::builder("ignored")
                .permitted_calls_in_half_open_state(1)
                .failure_classifier(Arc::new(PredicateClassifier::new(|_| false))),
        );
        circuit.transition_to_half_open_state();

        let permit = circuit.try_acquire_permission().unwrap();
        circuit.on_error(permit, Duration::from_millis(1), &"ignored");

        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        assert!(circuit.try_acquire_permission().is_ok());
    }

    #[test]
    fn test_disabled_and_forced_open() {
        let circuit = CircuitBreaker::builder("admin")
            .minimum_number_of_calls(1)
            .count_based_window(1)
            .build()
            .unwrap();

        circuit.transition_to_disabled_state();
        for _ in 0..10 {
            assert!(fail(&circuit).unwrap_err().into_execution().is_some());
        }
        assert_eq!(circuit.state(), CircuitState::Disabled);
        assert_eq!(circuit.metrics().buffered_calls, 0);

        circuit.transition_to_forced_open_state();
        assert!(succeed(&circuit).unwrap_err().is_not_permitted());

        circuit.transition_to_closed_state();
        assert!(succeed(&circuit).is_ok());
    }

    #[test]
    fn test_transition_events_and_reset() {
        let circuit = CircuitBreaker::builder("events").build().unwrap();
        let mut events = circuit.subscribe();

        circuit.transition_to_open_state();
        circuit.transition_to_closed_state();
        circuit.reset();

        let kinds: Vec<_> = events.drain().into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                BreakerEventKind::StateTransition {
                    from: CircuitState::Closed,
                    to: CircuitState::Open,
                },
                BreakerEventKind::StateTransition {
                    from: CircuitState::Open,
                    to: CircuitState::Closed,
                },
                BreakerEventKind::Reset,
            ]
        );
    }

    #[test]
    fn test_reset_clears_window() {
        let circuit = CircuitBreaker::builder("reset")
            .minimum_number_of_calls(10)
            .build()
            .unwrap();
        let _ = fail(&circuit);
        circuit.transition_to_forced_open_state();

        circuit.reset();

        assert!(circuit.is_closed());
        assert_eq!(circuit.metrics().buffered_calls, 0);
    }

    #[test]
    fn test_time_based_window_forgets_old_failures() {
        let (circuit, clock) = circuit_with_clock(
            CircuitBreaker::builder("timed")
                .time_based_window(5)
                .minimum_number_of_calls(2),
        );

        let _ = fail(&circuit);
        clock.advance(Duration::from_secs(6));
        succeed(&circuit).unwrap();
        succeed(&circuit).unwrap();

        assert!(circuit.is_closed());
        assert_eq!(circuit.metrics().failed_calls, 0);
    }

    #[test]
    fn test_concurrent_trial_calls_limited_to_quota() {
        let (circuit, _clock) = circuit_with_clock(
            CircuitBreaker::builder("contended").permitted_calls_in_half_open_state(5),
        );
        let circuit = Arc::new(circuit);
        circuit.transition_to_half_open_state();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let circuit = circuit.clone();
                thread::spawn(move || circuit.try_acquire_permission().ok())
            })
            .collect();
        let granted: Vec<Permit> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(granted.len(), 5);
        assert_eq!(circuit.metrics().not_permitted_calls, 3);
    }

    #[test]
    fn test_config_validation() {
        assert!(Config::default().validate().is_ok());

        let cases = [
            Config {
                slow_call_rate_threshold: -1.0,
                ..Config::default()
            },
            Config {
                minimum_number_of_calls: 0,
                ..Config::default()
            },
            Config {
                wait_jitter_factor: 1.5,
                ..Config::default()
            },
            Config {
                call_timeout: Some(Duration::ZERO),
                ..Config::default()
            },
        ];
        for config in cases {
            assert!(CircuitBreaker::new("invalid", config).is_err());
        }
    }
}
