//! Async decorators
//!
//! Outcomes of asynchronous work are recorded when the work completes, never
//! when it is started. Dropping a guarded future or stream before it finishes
//! records nothing and gives a half-open permit back.

use crate::{
    circuit::{CallOptions, CircuitBreaker, FallbackCause},
    errors::CircuitError,
    permits::Permit,
};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

impl CircuitBreaker {
    /// Execute an async operation with circuit breaker protection
    ///
    /// When `call_timeout` is configured the operation is bounded by it; a
    /// timeout is recorded as a failure and surfaces as `CircuitError::Timeout`
    /// unless a fallback handles it.
    ///
    /// ```rust
    /// use breaker_engine::{CallOptions, CircuitBreaker};
    ///
    /// # async fn run() {
    /// let circuit = CircuitBreaker::builder("inventory").build().unwrap();
    /// let stock = circuit
    ///     .call_async(|| async { Ok::<u32, String>(7) }, CallOptions::new())
    ///     .await;
    /// assert_eq!(stock.unwrap(), 7);
    /// # }
    /// ```
    pub async fn call_async<F, Fut, T, E>(
        &self,
        f: F,
        options: CallOptions<T, E>,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        let permit = match self.try_acquire_permission() {
            Ok(permit) => permit,
            Err(rejected) => {
                return self.recover(options.fallback, FallbackCause::NotPermitted(rejected));
            }
        };

        let start = self.monotonic_time();
        let result = match self.config().call_timeout {
            Some(limit) => tokio::time::timeout(limit, f()).await.map_err(|_| limit),
            None => Ok(f().await),
        };

        match result {
            Ok(Ok(value)) => {
                self.on_success(permit, self.elapsed_since(start));
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_error(permit, self.elapsed_since(start), &e);
                self.recover(options.fallback, FallbackCause::Failed(e))
            }
            Err(limit) => {
                self.on_timeout(permit, limit);
                self.recover(options.fallback, FallbackCause::TimedOut(limit))
            }
        }
    }

    /// Guard a stream of results as one call
    ///
    /// Admission is requested on the first poll. The stream ending records a
    /// success; the first `Err` item records a failure and ends the stream.
    pub fn decorate_stream<S, T, E>(self: &Arc<Self>, stream: S) -> GuardedStream<S>
    where
        S: Stream<Item = Result<T, E>>,
    {
        GuardedStream {
            circuit: Arc::clone(self),
            inner: Box::pin(stream),
            phase: Phase::Pending,
        }
    }
}

enum Phase {
    Pending,
    Running { permit: Permit, started_at: f64 },
    Done,
}

/// Stream wrapper returned by `CircuitBreaker::decorate_stream`
pub struct GuardedStream<S> {
    circuit: Arc<CircuitBreaker>,
    inner: Pin<Box<S>>,
    phase: Phase,
}

impl<S> GuardedStream<S> {
    /// Take the permit out of a running stream, leaving it finished
    fn finish(&mut self) -> Option<(Permit, f64)> {
        match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Running { permit, started_at } => Some((permit, started_at)),
            _ => None,
        }
    }
}

impl<S, T, E> Stream for GuardedStream<S>
where
    S: Stream<Item = Result<T, E>>,
    E: 'static,
{
    type Item = Result<T, CircuitError<E>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        match this.phase {
            Phase::Done => return Poll::Ready(None),
            Phase::Pending => match this.circuit.try_acquire_permission() {
                Ok(permit) => {
                    this.phase = Phase::Running {
                        permit,
                        started_at: this.circuit.monotonic_time(),
                    };
                }
                Err(rejected) => {
                    this.phase = Phase::Done;
                    return Poll::Ready(Some(Err(CircuitError::NotPermitted(rejected))));
                }
            },
            Phase::Running { .. } => {}
        }

        match ready!(this.inner.as_mut().poll_next(cx)) {
            Some(Ok(item)) => Poll::Ready(Some(Ok(item))),
            Some(Err(e)) => {
                if let Some((permit, started_at)) = this.finish() {
                    let elapsed = this.circuit.elapsed_since(started_at);
                    this.circuit.on_error(permit, elapsed, &e);
                }
                Poll::Ready(Some(Err(CircuitError::Execution(e))))
            }
            None => {
                if let Some((permit, started_at)) = this.finish() {
                    let elapsed = this.circuit.elapsed_since(started_at);
                    this.circuit.on_success(permit, elapsed);
                }
                Poll::Ready(None)
            }
        }
    }
}

impl<S> std::fmt::Debug for GuardedStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self.phase {
            Phase::Pending => "pending",
            Phase::Running { .. } => "running",
            Phase::Done => "done",
        };
        f.debug_struct("GuardedStream")
            .field("circuit", &self.circuit.name())
            .field("phase", &phase)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CircuitState, ManualClock};
    use futures::StreamExt;
    use std::time::Duration;

    fn half_open_circuit(quota: usize) -> Arc<CircuitBreaker> {
        let circuit = Arc::new(
            CircuitBreaker::builder("async")
                .permitted_calls_in_half_open_state(quota)
                .clock(Arc::new(ManualClock::new()))
                .build()
                .unwrap(),
        );
        circuit.transition_to_half_open_state();
        circuit
    }

    #[tokio::test]
    async fn test_call_async_records_success() {
        let circuit = CircuitBreaker::builder("async")
            .minimum_number_of_calls(1)
            .build()
            .unwrap();

        let result = circuit
            .call_async(|| async { Ok::<_, String>("ok") }, CallOptions::new())
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(circuit.metrics().successful_calls, 1);
    }

    #[tokio::test]
    async fn test_call_async_failure_opens_circuit() {
        let circuit = CircuitBreaker::builder("async")
            .minimum_number_of_calls(2)
            .count_based_window(2)
            .build()
            .unwrap();

        for _ in 0..2 {
            let result = circuit
                .call_async(|| async { Err::<(), _>("down") }, CallOptions::new())
                .await;
            assert!(matches!(result, Err(CircuitError::Execution("down"))));
        }

        assert!(circuit.is_open());
        let rejected = circuit
            .call_async(|| async { Ok::<_, &str>(()) }, CallOptions::new())
            .await;
        assert!(rejected.unwrap_err().is_not_permitted());
    }

    #[tokio::test]
    async fn test_call_async_fallback_on_failure() {
        let circuit = CircuitBreaker::builder("async").build().unwrap();

        let result = circuit
            .call_async(
                || async { Err::<String, _>("primary down".to_string()) },
                CallOptions::new().with_fallback(|ctx| match ctx.cause {
                    FallbackCause::Failed(e) => Ok(format!("cached ({e})")),
                    _ => Err("unexpected".to_string()),
                }),
            )
            .await;

        assert_eq!(result.unwrap(), "cached (primary down)");
        assert_eq!(circuit.metrics().failed_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_async_timeout_recorded_as_failure() {
        let circuit = CircuitBreaker::builder("slow_dependency")
            .call_timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let mut events = circuit.subscribe();

        let result = circuit
            .call_async(
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, String>("late")
                },
                CallOptions::new(),
            )
            .await;

        match result {
            Err(CircuitError::Timeout { circuit: name, after }) => {
                assert_eq!(name, "slow_dependency");
                assert_eq!(after, Duration::from_millis(100));
            }
            other => panic!("Expected timeout, got {:?}", other),
        }
        assert_eq!(circuit.metrics().failed_calls, 1);

        let kinds: Vec<_> = events.drain().into_iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&crate::BreakerEventKind::Timeout {
            after: Duration::from_millis(100)
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_call_releases_half_open_permit() {
        let circuit = half_open_circuit(1);

        let pending = {
            let circuit = circuit.clone();
            tokio::spawn(async move {
                circuit
                    .call_async(
                        || async {
                            tokio::time::sleep(Duration::from_secs(60)).await;
                            Ok::<_, String>(())
                        },
                        CallOptions::new(),
                    )
                    .await
            })
        };

        // Let the trial call take the only permit
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(circuit.try_acquire_permission().is_err());

        pending.abort();
        let _ = pending.await;

        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        let permit = circuit.try_acquire_permission().expect("Permit should be released");
        circuit.on_success(permit, Duration::from_millis(5));
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_stream_success_recorded_at_end() {
        let circuit = half_open_circuit(1);

        let mut guarded =
            circuit.decorate_stream(futures::stream::iter(vec![Ok::<_, String>(1), Ok(2)]));

        assert_eq!(guarded.next().await.unwrap().unwrap(), 1);
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        assert_eq!(guarded.next().await.unwrap().unwrap(), 2);
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        assert!(guarded.next().await.is_none());
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_stream_error_recorded_and_ends_stream() {
        let circuit = half_open_circuit(1);

        let guarded = circuit.decorate_stream(futures::stream::iter(vec![
            Ok(1),
            Err("broken pipe"),
            Ok(3),
        ]));
        let items: Vec<_> = guarded.collect().await;

        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(CircuitError::Execution("broken pipe"))));
        assert_eq!(circuit.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_stream_rejected_when_open() {
        let circuit = half_open_circuit(1);
        circuit.transition_to_forced_open_state();

        let items: Vec<_> = circuit
            .decorate_stream(futures::stream::iter(vec![Ok::<_, String>(1)]))
            .collect()
            .await;

        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Err(e) if e.is_not_permitted()));
    }

    #[tokio::test]
    async fn test_dropped_stream_releases_permit() {
        let circuit = half_open_circuit(1);

        let mut guarded =
            circuit.decorate_stream(futures::stream::iter(vec![Ok::<_, String>(1), Ok(2)]));
        assert!(guarded.next().await.is_some());
        assert!(circuit.try_acquire_permission().is_err());

        drop(guarded);
        assert!(circuit.try_acquire_permission().is_ok());
    }
}
