//! Composing retry, circuit breaker, rate limiter and bulkhead around one call

use resilience_machines::{
    Backoff, BulkheadConfig, CircuitConfig, Decorators, RateLimiterConfig, Registry, RetryConfig,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "resilience_machines=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let registry = Registry::new();
    let circuit = registry.circuit_breaker_with(
        "inventory",
        CircuitConfig {
            sliding_window_size: 6,
            minimum_number_of_calls: 6,
            wait_duration_in_open_state: Duration::from_millis(200),
            permitted_calls_in_half_open: 1,
            ..Default::default()
        },
    )?;
    let retry = registry.retry_with(
        "inventory",
        RetryConfig {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(10),
                multiplier: 2.0,
                max: Duration::from_millis(100),
            },
            jitter_factor: 0.2,
            retry_on_rejection: false,
        },
    )?;
    let limiter = registry.rate_limiter_with(
        "inventory",
        RateLimiterConfig {
            limit_for_period: 20,
            limit_refresh_period: Duration::from_secs(1),
            timeout_duration: Duration::from_millis(50),
        },
    )?;
    let bulkhead = registry.bulkhead_with(
        "inventory",
        BulkheadConfig {
            max_concurrent_calls: 4,
            max_wait_duration: Duration::from_millis(20),
        },
    )?;

    // Healthy for a few calls, then the dependency goes down
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let lookup = Decorators::of(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        if (3..12).contains(&n) {
            Err(format!("inventory service unavailable (call {})", n))
        } else {
            Ok(100 - n)
        }
    })
    .with_retry(retry)
    .with_circuit_breaker(Arc::clone(&circuit))
    .with_rate_limiter(limiter)
    .with_bulkhead(bulkhead)
    .with_timeout(Duration::from_millis(250))
    .with_rejection_fallback(|err| {
        tracing::info!(error = %err, "serving stale stock level");
        Some(0)
    })
    .build();

    for request in 1..=8 {
        match lookup.call() {
            Ok(stock) => println!("request {}: stock {}", request, stock),
            Err(e) => println!(
                "request {}: failed with {} (exit code {})",
                request,
                e,
                e.exit_code()
            ),
        }
        println!("  breaker states: {:?}", registry.circuit_breaker_states());
    }

    std::thread::sleep(Duration::from_millis(250));
    println!("after wait: {:?}", lookup.call());
    println!("metrics: {:?}", circuit.metrics());
    Ok(())
}
