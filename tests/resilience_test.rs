// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use resilience_rs::metrics::{MetricsSink, BREAKER_CALLS, BREAKER_OPENS, RETRY_EXHAUSTED};
use resilience_rs::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, ErrorKind, GuardConfig, ResilienceError,
    ResilienceRegistry, RetryExecutor, RetryPolicy,
};
use tokio::sync::Barrier;
use tokio::time::{advance, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn unavailable() -> ResilienceError {
    ResilienceError::Connection("upstream unavailable".to_string())
}

#[tokio::test(start_paused = true)]
async fn test_breaker_recovery_timeline() {
    init_tracing();
    let breaker = CircuitBreaker::new(
        "search",
        CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_recovery_timeout(Duration::from_secs(60))
            .with_success_threshold(2),
        Arc::new(MetricsSink::new()),
    );
    let invocations = AtomicU32::new(0);

    // Failures at t=0, t=5, t=10
    for step in 0..3 {
        if step > 0 {
            advance(Duration::from_secs(5)).await;
        }
        let result: Result<(), _> = breaker
            .call(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(breaker.stats().circuit_opened_count, 1);

    // t=30: rejected without invocation
    advance(Duration::from_secs(20)).await;
    let rejected = breaker
        .call(|| async {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    match rejected {
        Err(ResilienceError::CircuitOpen {
            consecutive_failures,
            last_failure_time,
            ..
        }) => {
            assert_eq!(consecutive_failures, 3);
            assert!(last_failure_time.is_some());
        }
        other => panic!("expected CircuitOpen, got {other:?}"),
    }
    let stats = breaker.stats();
    assert_eq!(stats.total_calls, 4);
    assert_eq!(stats.failed_calls, 3);
    assert_eq!(stats.successful_calls, 0);
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    // t=71: trial call goes through; one success is not enough to close
    advance(Duration::from_secs(41)).await;
    breaker
        .call(|| async {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker.call(|| async { Ok(()) }).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);

    let stats = breaker.stats();
    assert_eq!(stats.total_calls, 6);
    assert_eq!(stats.consecutive_failures, 0);
    assert_eq!(stats.circuit_opened_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_threshold_minus_one_failures_stay_closed() {
    let breaker = CircuitBreaker::new(
        "search",
        CircuitBreakerConfig::new().with_failure_threshold(4),
        Arc::new(MetricsSink::new()),
    );

    for _ in 0..3 {
        let _: Result<(), _> = breaker.call(|| async { Err(unavailable()) }).await;
    }
    assert_eq!(breaker.state(), CircuitState::Closed);

    let _: Result<(), _> = breaker.call(|| async { Err(unavailable()) }).await;
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(breaker.stats().circuit_opened_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_delays_before_each_attempt() {
    let executor = RetryExecutor::new(
        "search",
        RetryPolicy::new()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(2.0)
            .with_jitter(false),
        Arc::new(MetricsSink::new()),
    );
    let started = Mutex::new(Vec::new());

    let result: Result<(), _> = executor
        .run(|| {
            started.lock().unwrap().push(Instant::now());
            async { Err(unavailable()) }
        })
        .await;
    assert!(result.is_err());

    let started = started.into_inner().unwrap();
    assert_eq!(started.len(), 3);
    assert_eq!(started[1] - started[0], Duration::from_secs(1));
    assert_eq!(started[2] - started[1], Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_cycles_open_breaker() -> anyhow::Result<()> {
    init_tracing();
    let metrics = Arc::new(MetricsSink::new());
    let registry = ResilienceRegistry::with_metrics(metrics.clone());
    let guard = registry.get_or_create(
        "search",
        Some(GuardConfig::new(
            CircuitBreakerConfig::new().with_failure_threshold(3),
            RetryPolicy::standard().with_jitter(false),
        )),
    )?;
    let attempts = AtomicU32::new(0);

    for _ in 0..3 {
        let result: Result<(), _> = guard
            .call(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            })
            .await;
        assert!(matches!(result, Err(ResilienceError::Connection(_))));
    }

    // Three cycles of three attempts each, counted once per cycle
    assert_eq!(attempts.load(Ordering::SeqCst), 9);
    assert_eq!(guard.breaker.stats().failed_calls, 3);
    assert_eq!(guard.breaker.state(), CircuitState::Open);

    let executor_stats = guard.executor.stats();
    assert_eq!(executor_stats.total_attempts, 9);
    assert_eq!(executor_stats.total_retries, 6);
    assert_eq!(executor_stats.failed_attempts, 3);
    assert_eq!(executor_stats.average_attempts, 3.0);

    // An open breaker never enters the retry cycle
    let before = Instant::now();
    let rejected: Result<(), _> = guard
        .call(|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(rejected.unwrap_err().is_circuit_open());
    assert_eq!(before.elapsed(), Duration::ZERO);
    assert_eq!(attempts.load(Ordering::SeqCst), 9);
    assert_eq!(guard.executor.stats().total_attempts, 9);

    let opens = metrics.counter(BREAKER_OPENS).expect("core metric");
    assert_eq!(opens.get(&[("breaker", "search")]), 1);
    let exhausted = metrics.counter(RETRY_EXHAUSTED).expect("core metric");
    assert_eq!(exhausted.get(&[("executor", "search")]), 3);
    let calls = metrics.counter(BREAKER_CALLS).expect("core metric");
    assert_eq!(calls.get(&[("breaker", "search"), ("outcome", "rejected")]), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_breaker_deadline_bounds_retry_cycle() {
    let registry = ResilienceRegistry::new();
    let guard = registry
        .get_or_create(
            "search",
            Some(GuardConfig::new(
                CircuitBreakerConfig::new().with_timeout(Duration::from_millis(2500)),
                RetryPolicy::new()
                    .with_max_attempts(5)
                    .with_base_delay(Duration::from_secs(1))
                    .with_jitter(false),
            )),
        )
        .unwrap();

    let result: Result<(), _> = guard.call(|| async { Err(unavailable()) }).await;

    assert!(matches!(result, Err(ResilienceError::Timeout { .. })));
    let stats = guard.breaker.stats();
    assert_eq!(stats.failed_calls, 1);
    assert_eq!(stats.timeout_calls, 1);

    // Attempts at t=0 and t=1; the 2s sleep before the third is cut short
    let executor_stats = guard.executor.stats();
    assert_eq!(executor_stats.total_attempts, 2);
    assert_eq!(executor_stats.failed_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_caller_cancellation_recorded_once() {
    let registry = ResilienceRegistry::new();
    let guard = registry.get_or_create("search", None).unwrap();

    let call = guard.call(|| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(())
    });
    let outcome = tokio::time::timeout(Duration::from_secs(1), call).await;
    assert!(outcome.is_err());

    let stats = guard.breaker.stats();
    assert_eq!(stats.total_calls, 1);
    assert_eq!(stats.failed_calls, 1);
    assert_eq!(stats.timeout_calls, 1);
    assert_eq!(stats.consecutive_failures, 1);
    assert_eq!(guard.executor.stats().failed_attempts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_are_not_serialized() {
    const CALLERS: usize = 16;
    let registry = Arc::new(ResilienceRegistry::new());
    // Every caller waits inside the operation until all of them are in it
    let barrier = Arc::new(Barrier::new(CALLERS));

    let mut handles = Vec::new();
    for _ in 0..CALLERS {
        let registry = registry.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            registry
                .execute("search", || {
                    let barrier = barrier.clone();
                    async move {
                        barrier.wait().await;
                        Ok(())
                    }
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let status = registry.status();
    let breaker = &status.breakers["search"];
    assert_eq!(breaker.state, CircuitState::Closed);
    assert_eq!(breaker.stats.total_calls, CALLERS as u64);
    assert_eq!(breaker.stats.successful_calls, CALLERS as u64);
    assert_eq!(breaker.success_rate_percent, 100.0);
    assert_eq!(status.executors["search"].stats.total_attempts, CALLERS as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_keep_counts_consistent() {
    const CALLERS: u64 = 40;
    let registry = Arc::new(ResilienceRegistry::new());
    registry
        .get_or_create(
            "search",
            Some(GuardConfig::new(
                CircuitBreakerConfig::new().with_failure_threshold(10),
                RetryPolicy::new().with_max_attempts(1),
            )),
        )
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..CALLERS {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry
                .execute("search", || async {
                    Err::<(), _>(ResilienceError::operation(ErrorKind::Transient, "flaky"))
                })
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_err());
    }

    let stats = registry.get_or_create("search", None).unwrap().breaker.stats();
    assert_eq!(stats.total_calls, CALLERS);
    assert_eq!(
        stats.failed_calls + stats.rejected_calls + stats.successful_calls,
        CALLERS
    );
    assert!(stats.failed_calls >= 10);
    assert_eq!(stats.circuit_opened_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_recovery_enters_half_open_once() {
    const CALLERS: usize = 16;
    let breaker = Arc::new(CircuitBreaker::new(
        "search",
        CircuitBreakerConfig::new()
            .with_failure_threshold(1)
            .with_success_threshold(100)
            .with_recovery_timeout(Duration::from_millis(50)),
        Arc::new(MetricsSink::new()),
    ));
    let _: Result<(), _> = breaker.call(|| async { Err(unavailable()) }).await;
    assert_eq!(breaker.state(), CircuitState::Open);
    tokio::time::sleep(Duration::from_millis(80)).await;

    // All callers arrive together past the recovery timeout, and every trial
    // stays in flight until all of them have been admitted
    let start = Arc::new(Barrier::new(CALLERS));
    let in_flight = Arc::new(Barrier::new(CALLERS));
    let invocations = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..CALLERS {
        let breaker = breaker.clone();
        let start = start.clone();
        let in_flight = in_flight.clone();
        let invocations = invocations.clone();
        handles.push(tokio::spawn(async move {
            start.wait().await;
            breaker
                .call(|| async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    in_flight.wait().await;
                    Ok(())
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(invocations.load(Ordering::SeqCst), CALLERS as u32);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    let stats = breaker.stats();
    // A second reset of the success streak would have dropped earlier trials
    assert_eq!(stats.consecutive_successes, CALLERS as u64);
    assert_eq!(stats.successful_calls, CALLERS as u64);
    assert_eq!(stats.rejected_calls, 0);
    assert_eq!(stats.total_calls, CALLERS as u64 + 1);
    assert_eq!(stats.circuit_opened_count, 1);
}

#[test]
fn test_counter_labels_accumulate_independently() {
    let sink = MetricsSink::empty();
    let requests = sink.register_counter("requests", "Requests by region");

    requests.inc(2, &[("region", "a")]);
    requests.inc(3, &[("region", "b")]);
    requests.inc(1, &[("region", "a")]);
    requests.inc(4, &[]);

    assert_eq!(requests.get(&[("region", "a")]), 3);
    assert_eq!(requests.get(&[("region", "b")]), 3);
    assert_eq!(requests.get(&[]), 10);
}
