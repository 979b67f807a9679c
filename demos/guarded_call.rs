// SPDX-License-Identifier: MIT OR Apache-2.0

//! Example: Guarding a Flaky Operation
//!
//! This example demonstrates the registry-driven resilience flow:
//! - Retry executor with exponential backoff
//! - Circuit breaker wrapping whole retry cycles
//! - Status and metrics snapshots

use resilience_rs::metrics::{BREAKER_CALLS, RETRY_ATTEMPTS};
use resilience_rs::{
    CircuitBreakerConfig, ErrorKind, GuardConfig, ResilienceError, ResilienceRegistry,
    ResilienceSettings, RetryPolicy,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const SETTINGS: &str = r#"
breakers:
  search:
    failure_threshold: 2
    recovery_timeout: 1
    success_threshold: 1
    timeout: 5
retries:
  search:
    max_attempts: 3
    base_delay: 0.1
    max_delay: 0.5
    jitter_enabled: false
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (for demonstration)
    tracing_subscriber::fmt::init();

    // ==========================================================================
    // 1. Registry from Settings
    // ==========================================================================
    println!("=== Registry from Settings ===");

    let settings = ResilienceSettings::from_yaml(SETTINGS)?;
    let registry = ResilienceRegistry::from_settings(settings);

    // Fails twice, then succeeds: one retry cycle absorbs the failures
    let calls = AtomicU32::new(0);
    let page = registry
        .execute("search", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ResilienceError::Connection("connection reset".to_string()))
            } else {
                Ok("<table>results</table>")
            }
        })
        .await?;
    println!("Fetched {page} after {} attempts", calls.load(Ordering::SeqCst));

    // ==========================================================================
    // 2. Breaker Opens after Failed Cycles
    // ==========================================================================
    println!("\n=== Breaker Opens after Failed Cycles ===");

    for cycle in 1..=3 {
        let result: Result<(), ResilienceError> = registry
            .execute("search", || async {
                Err(ResilienceError::operation(ErrorKind::Unavailable, "maintenance"))
            })
            .await;
        match result {
            Err(e) if e.is_circuit_open() => println!("Cycle {cycle}: rejected ({e})"),
            Err(e) => println!("Cycle {cycle}: failed ({e})"),
            Ok(()) => println!("Cycle {cycle}: succeeded"),
        }
    }

    let guard = registry.get_or_create("search", None)?;
    println!("State: {}", guard.breaker.state());
    if let Some(wait) = guard.breaker.time_until_retry() {
        println!("Next trial in {wait:?}");
        tokio::time::sleep(wait).await;
    }

    let recovered = registry.execute("search", || async { Ok(42) }).await?;
    println!("Trial call returned {recovered}, state: {}", guard.breaker.state());

    // ==========================================================================
    // 3. Explicit Configuration
    // ==========================================================================
    println!("\n=== Explicit Configuration ===");

    let config = GuardConfig::new(
        CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_timeout(Duration::from_millis(200)),
        RetryPolicy::network().with_max_attempts(2),
    );
    let slow = registry.get_or_create("detail", Some(config))?;
    let result = slow
        .call(|| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok("too late")
        })
        .await;
    println!("Slow call: {result:?}");

    // ==========================================================================
    // 4. Status and Metrics
    // ==========================================================================
    println!("\n=== Status ===");

    let status = registry.status();
    for (name, breaker) in &status.breakers {
        println!(
            "{name}: {} ({:.1}% success, {} opens)",
            breaker.state, breaker.success_rate_percent, breaker.stats.circuit_opened_count
        );
    }
    println!("Degraded: {}", status.is_degraded());

    let metrics = registry.metrics().snapshot();
    println!("\n=== Metrics ===");
    println!("{:#?}", metrics.counters[BREAKER_CALLS].values);
    println!("{:#?}", metrics.counters[RETRY_ATTEMPTS].values);

    Ok(())
}
