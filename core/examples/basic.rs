//! Basic circuit breaker usage example

use breaker_engine::{BreakerEventKind, CallOptions, FallbackCause, Registry};
use std::time::Duration;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "breaker_engine=info".into()),
        )
        .init();

    println!("=== Circuit Breaker Basic Example ===\n");

    let registry = Registry::with_defaults();
    let mut events = registry.subscribe();

    let circuit = registry
        .get_or_create_with(
            "payment_api",
            breaker_engine::Config {
                failure_rate_threshold: 50.0,
                sliding_window_size: 4,
                minimum_number_of_calls: 4,
                wait_duration_in_open_state: Duration::from_millis(200),
                permitted_calls_in_half_open_state: 1,
                ..Default::default()
            },
        )
        .expect("valid configuration");

    println!("Initial state: {}\n", circuit.state_name());

    println!("--- Successful calls ---");
    for i in 1..=2 {
        match circuit.call(move || Ok::<_, String>(format!("Payment {}", i))) {
            Ok(result) => println!("✓ {}", result),
            Err(e) => println!("✗ Error: {}", e),
        }
    }
    println!("State: {}\n", circuit.state_name());

    println!("--- Triggering failures ---");
    for i in 1..=2 {
        match circuit.call(move || Err::<String, _>(format!("Payment failed {}", i))) {
            Ok(_) => println!("✓ Success"),
            Err(e) => println!("✗ {}", e),
        }
    }
    println!("State: {} (circuit opened)\n", circuit.state_name());

    println!("--- Attempting call while open, with fallback ---");
    let result = circuit.call((
        || Ok::<_, String>("Should be rejected".to_string()),
        CallOptions::new().with_fallback(|ctx| match ctx.cause {
            FallbackCause::NotPermitted(_) => Ok(format!("Queued for later ({})", ctx.state)),
            FallbackCause::Failed(e) => Err(e),
            FallbackCause::TimedOut(after) => Err(format!("timed out after {after:?}")),
        }),
    ));
    match result {
        Ok(result) => println!("↺ {}", result),
        Err(e) => println!("✗ {}", e),
    }
    println!();

    println!("--- Waiting for the half-open window ---");
    std::thread::sleep(Duration::from_millis(250));
    match circuit.call(|| Ok::<_, String>("Trial payment successful")) {
        Ok(result) => println!("✓ {}", result),
        Err(e) => println!("✗ {}", e),
    }
    println!("State: {}\n", circuit.state_name());

    let metrics = circuit.metrics();
    println!(
        "Metrics: buffered={} failure_rate={} rejected={}",
        metrics.buffered_calls, metrics.failure_rate, metrics.not_permitted_calls
    );

    println!("\n--- Transitions observed ---");
    for event in events.drain() {
        if let BreakerEventKind::StateTransition { from, to } = event.kind {
            println!("{}: {} -> {}", event.circuit_name, from, to);
        }
    }
}
