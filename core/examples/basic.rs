//! Basic circuit breaker usage example

use resilience_machines::{CallOptions, CircuitBreaker, ManualClock};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "resilience_machines=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("=== Circuit Breaker Basic Example ===\n");

    // A manual clock lets the example skip the open-state wait
    let clock = Arc::new(ManualClock::new());

    // Create a circuit with builder API
    let circuit = CircuitBreaker::builder("payment_api")
        .failure_rate_threshold(50.0)
        .count_based_window(4)
        .minimum_number_of_calls(4)
        .wait_duration_in_open_state(Duration::from_secs(5))
        .permitted_calls_in_half_open(2)
        .clock(clock.clone())
        .on_open(|name| println!("🔴 Circuit '{}' opened!", name))
        .on_close(|name| println!("🟢 Circuit '{}' closed!", name))
        .on_half_open(|name| println!("🟡 Circuit '{}' half-open, testing...", name))
        .build();

    println!("Initial state: {}\n", circuit.state_name());

    // Simulate successful calls
    println!("--- Successful calls ---");
    for i in 1..=2 {
        match circuit.call(move || Ok::<_, String>(format!("Payment {}", i))) {
            Ok(result) => println!("✓ {}", result),
            Err(e) => println!("✗ Error: {}", e),
        }
    }
    println!("State: {}\n", circuit.state_name());

    // Simulate failures
    println!("--- Triggering failures ---");
    for i in 1..=2 {
        match circuit.call(move || Err::<String, _>(format!("Payment failed {}", i))) {
            Ok(_) => println!("✓ Success"),
            Err(e) => println!("✗ {}", e),
        }
    }
    let metrics = circuit.metrics();
    println!(
        "State: {} (failure rate {:.0}%)\n",
        circuit.state_name(),
        metrics.failure_rate
    );

    // Try calling while open
    println!("--- Attempting call while open ---");
    match circuit.call(|| Ok::<_, String>("Should be rejected")) {
        Ok(_) => println!("✓ Success"),
        Err(e) => println!("✗ {} (exit code {})", e, e.exit_code()),
    }

    // Fallback instead of an error
    let cached = circuit.call((
        || Ok::<_, String>("live quote".to_string()),
        CallOptions::new().with_fallback(|ctx| {
            Ok(format!("cached quote ({} is {})", ctx.circuit_name, ctx.state))
        }),
    ));
    println!("Fallback: {:?}\n", cached);

    // Let the wait elapse and recover through trial calls
    println!("--- Recovering ---");
    clock.advance(Duration::from_secs(5));
    for i in 1..=2 {
        match circuit.call(move || Ok::<_, String>(format!("Trial payment {}", i))) {
            Ok(result) => println!("✓ {}", result),
            Err(e) => println!("✗ {}", e),
        }
    }
    println!("State: {}\n", circuit.state_name());

    // Maintenance window
    println!("--- Forced open ---");
    circuit.transition_to_forced_open_state();
    match circuit.call(|| Ok::<_, String>("Payment during maintenance")) {
        Ok(result) => println!("✓ {}", result),
        Err(e) => println!("✗ {}", e),
    }
    circuit.reset();
    println!("State after reset: {}", circuit.state_name());
}
