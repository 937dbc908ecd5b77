//! Metrics exporter binding
//!
//! A `MetricsPublisher` polls registry snapshots and hands them to a
//! `MetricsSink`. `RecorderSink` forwards them to whatever recorder is
//! installed behind the `metrics` facade.
//!
//! # Metrics
//! - `circuit_breaker_state` (gauge): 1 for the current state, 0 otherwise; labels name, state
//! - `circuit_breaker_buffered_calls` (gauge): buffered calls; labels name, kind
//! - `circuit_breaker_failure_rate` (gauge): percentage, -1 below the minimum calls
//! - `circuit_breaker_slow_call_rate` (gauge): percentage, -1 below the minimum calls
//! - `circuit_breaker_not_permitted_calls` (counter): rejected calls

use crate::{
    circuit::{CircuitState, Metrics},
    registry::Registry,
};
use ::metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Destination for per-circuit metric snapshots
pub trait MetricsSink: Send + Sync {
    fn record(&self, name: &str, metrics: &Metrics);
}

/// Sink writing to the global `metrics` recorder
#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderSink;

impl MetricsSink for RecorderSink {
    fn record(&self, name: &str, metrics: &Metrics) {
        for state in CircuitState::ALL {
            let value = if state == metrics.state { 1.0 } else { 0.0 };
            gauge!("circuit_breaker_state", "name" => name.to_string(), "state" => state.as_str())
                .set(value);
        }

        let buffered = [
            ("successful", metrics.successful_calls),
            ("failed", metrics.failed_calls),
            ("slow_successful", metrics.slow_successful_calls),
            ("slow_failed", metrics.slow_failed_calls),
        ];
        for (kind, calls) in buffered {
            gauge!("circuit_breaker_buffered_calls", "name" => name.to_string(), "kind" => kind)
                .set(calls as f64);
        }

        gauge!("circuit_breaker_failure_rate", "name" => name.to_string())
            .set(metrics.failure_rate as f64);
        gauge!("circuit_breaker_slow_call_rate", "name" => name.to_string())
            .set(metrics.slow_call_rate as f64);
        counter!("circuit_breaker_not_permitted_calls", "name" => name.to_string())
            .absolute(metrics.not_permitted_calls);
    }
}

/// Periodically pushes registry snapshots into a sink
#[derive(Clone)]
pub struct MetricsPublisher {
    registry: Arc<Registry>,
    sink: Arc<dyn MetricsSink>,
}

impl MetricsPublisher {
    pub fn new(registry: Arc<Registry>, sink: Arc<dyn MetricsSink>) -> Self {
        Self { registry, sink }
    }

    /// Publish one snapshot of every circuit; returns how many were published
    pub fn publish_once(&self) -> usize {
        let snapshots = self.registry.snapshots();
        for (name, metrics) in &snapshots {
            self.sink.record(name, metrics);
        }
        snapshots.len()
    }

    /// Publish on a fixed interval until the handle is aborted
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let published = self.publish_once();
                debug!(circuits = published, "Published circuit breaker metrics");
            }
        })
    }
}

impl std::fmt::Debug for MetricsPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsPublisher")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
