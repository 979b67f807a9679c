// SPDX-License-Identifier: MIT OR Apache-2.0

//! Circuit breaker pattern implementation for guarding unreliable operations.
//!
//! The circuit breaker prevents cascading failures by temporarily rejecting
//! calls to a failing dependency and letting it recover.
//!
//! # States
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: Calls fail immediately with [`ResilienceError::CircuitOpen`]
//! - **Half-Open**: Trial calls test whether the dependency has recovered
//!
//! # Example
//!
//! ```ignore
//! use resilience_rs::runtime::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let config = CircuitBreakerConfig::default()
//!     .with_failure_threshold(3)
//!     .with_recovery_timeout(Duration::from_secs(120));
//!
//! let breaker = CircuitBreaker::new("search", config, metrics);
//!
//! let result = breaker.call(|| async {
//!     fetch_page().await
//! }).await;
//! ```

use crate::error::{ResilienceError, Result};
use crate::metrics::{
    Counter, Gauge, Histogram, MetricsSink, SlidingWindow, BREAKER_CALLS, BREAKER_CALL_DURATION,
    BREAKER_LATENCY, BREAKER_OPENS, BREAKER_STATE, DEFAULT_WINDOW,
};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, calls pass through normally.
    Closed,
    /// Circuit is open, calls fail immediately.
    Open,
    /// Circuit is half-open, testing if the dependency has recovered.
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used by the state gauge.
    #[must_use]
    pub fn as_gauge_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u64,
    /// Time after the last failure before an open circuit admits a trial call.
    pub recovery_timeout: Duration,
    /// Consecutive successes in half-open state before closing.
    pub success_threshold: u64,
    /// Deadline for each invoked call.
    pub timeout: Duration,
    /// Maximum concurrent trial calls while half-open; `None` admits all.
    pub half_open_max_calls: Option<usize>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            timeout: Duration::from_secs(30),
            half_open_max_calls: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u64) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the recovery timeout.
    #[must_use]
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Set the success threshold for recovery.
    #[must_use]
    pub fn with_success_threshold(mut self, threshold: u64) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the per-call timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bound the number of concurrent trial calls in half-open state.
    #[must_use]
    pub fn with_half_open_max_calls(mut self, max: usize) -> Self {
        self.half_open_max_calls = Some(max);
        self
    }

    /// Check that thresholds and the call timeout are non-zero.
    ///
    /// # Errors
    ///
    /// Returns `ResilienceError::Config` naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::Config(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(ResilienceError::Config(
                "success_threshold must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ResilienceError::Config(
                "timeout must be greater than zero".to_string(),
            ));
        }
        if self.half_open_max_calls == Some(0) {
            return Err(ResilienceError::Config(
                "half_open_max_calls must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counters kept by a circuit breaker.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Calls rejected without invoking the operation.
    pub rejected_calls: u64,
    /// Failed calls that exceeded their deadline or were cancelled.
    pub timeout_calls: u64,
    pub circuit_opened_count: u64,
    pub consecutive_failures: u64,
    pub consecutive_successes: u64,
    pub last_failure_time: Option<SystemTime>,
    pub last_success_time: Option<SystemTime>,
}

/// Status snapshot of a circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub stats: CircuitBreakerStats,
    pub success_rate_percent: f64,
    pub config: CircuitBreakerConfig,
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    stats: CircuitBreakerStats,
    last_failure_at: Option<Instant>,
    half_open_in_flight: usize,
    /// Bumped on every entry into half-open; trials carry the value they were admitted under.
    half_open_generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Error,
    Timeout,
    Cancelled,
}

/// Circuit breaker for protecting against cascading failures.
///
/// All bookkeeping happens under a short synchronous lock; the wrapped
/// operation and its deadline run outside it, so concurrent callers may
/// execute the operation simultaneously.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    core: Mutex<BreakerCore>,
    calls: Arc<Counter>,
    opens: Arc<Counter>,
    state_gauge: Arc<Gauge>,
    durations: Arc<Histogram>,
    latency: Arc<SlidingWindow>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker reporting into `metrics`.
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        metrics: Arc<MetricsSink>,
    ) -> Self {
        let name = name.into();
        let breaker = Self {
            calls: metrics.register_counter(BREAKER_CALLS, "Calls through circuit breakers"),
            opens: metrics.register_counter(BREAKER_OPENS, "Circuit breaker opens"),
            state_gauge: metrics.register_gauge(
                BREAKER_STATE,
                "Circuit breaker state (0=closed, 1=half-open, 2=open)",
            ),
            durations: metrics.register_histogram(
                BREAKER_CALL_DURATION,
                "Circuit breaker call duration in seconds",
                None,
            ),
            latency: metrics.register_sliding_window(BREAKER_LATENCY, DEFAULT_WINDOW),
            core: Mutex::new(BreakerCore {
                state: CircuitState::Closed,
                stats: CircuitBreakerStats::default(),
                last_failure_at: None,
                half_open_in_flight: 0,
                half_open_generation: 0,
            }),
            name,
            config,
        };
        breaker.state_gauge.set(
            CircuitState::Closed.as_gauge_value(),
            &[("breaker", &breaker.name)],
        );

        info!(
            breaker = %breaker.name,
            failure_threshold = breaker.config.failure_threshold,
            recovery_timeout_ms = breaker.config.recovery_timeout.as_millis() as u64,
            "Circuit breaker initialized"
        );
        breaker
    }

    /// Create a circuit breaker with default configuration and its own metrics sink.
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(
            name,
            CircuitBreakerConfig::default(),
            Arc::new(MetricsSink::new()),
        )
    }

    /// Execute an async operation with circuit breaker protection.
    ///
    /// # Errors
    ///
    /// Returns `ResilienceError::CircuitOpen` without invoking the operation
    /// if the circuit is open, `ResilienceError::Timeout` if the call exceeds
    /// its deadline, and the operation's own error otherwise.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let trial = self.admit()?;
        let mut in_flight = InFlight {
            breaker: self,
            trial,
            started: Instant::now(),
            settled: false,
        };

        match tokio::time::timeout(self.config.timeout, operation()).await {
            Ok(Ok(value)) => {
                in_flight.succeed();
                Ok(value)
            }
            Ok(Err(err)) => {
                let failure = if err.is_timeout() {
                    Failure::Timeout
                } else {
                    Failure::Error
                };
                in_flight.fail(failure, &err.to_string());
                Err(err)
            }
            Err(_) => {
                let err = ResilienceError::Timeout {
                    name: self.name.clone(),
                    timeout: self.config.timeout,
                };
                in_flight.fail(Failure::Timeout, &err.to_string());
                Err(err)
            }
        }
    }

    /// Count the call and decide whether it may proceed. Returns the
    /// half-open generation when the call is a trial.
    fn admit(&self) -> Result<Option<u64>> {
        let mut core = self.lock();
        core.stats.total_calls += 1;

        if core.state == CircuitState::Open {
            let recovered = core
                .last_failure_at
                .is_none_or(|at| at.elapsed() >= self.config.recovery_timeout);
            if !recovered {
                return Err(self.reject(core));
            }
            self.transition(&mut core, CircuitState::HalfOpen);
        }

        if core.state == CircuitState::HalfOpen {
            if let Some(max) = self.config.half_open_max_calls {
                if core.half_open_in_flight >= max {
                    return Err(self.reject(core));
                }
            }
            core.half_open_in_flight += 1;
            return Ok(Some(core.half_open_generation));
        }

        Ok(None)
    }

    fn reject(&self, mut core: MutexGuard<'_, BreakerCore>) -> ResilienceError {
        core.stats.rejected_calls += 1;
        let consecutive_failures = core.stats.consecutive_failures;
        let last_failure_time = core.stats.last_failure_time;
        let state = core.state;
        drop(core);

        self.calls
            .inc(1, &[("breaker", &self.name), ("outcome", "rejected")]);
        warn!(
            breaker = %self.name,
            state = %state,
            consecutive_failures,
            "Circuit breaker is open, rejecting call"
        );
        ResilienceError::CircuitOpen {
            name: self.name.clone(),
            consecutive_failures,
            last_failure_time,
        }
    }

    fn record_success(&self, trial: Option<u64>, elapsed: Duration) {
        let mut core = self.lock();
        release_trial(&mut core, trial);
        core.stats.successful_calls += 1;
        core.stats.consecutive_successes += 1;
        core.stats.consecutive_failures = 0;
        core.stats.last_success_time = Some(SystemTime::now());

        if core.state == CircuitState::HalfOpen
            && core.stats.consecutive_successes >= self.config.success_threshold
        {
            self.transition(&mut core, CircuitState::Closed);
        }
        let state = core.state;
        let consecutive_successes = core.stats.consecutive_successes;
        drop(core);

        self.observe(elapsed, "success");
        debug!(
            breaker = %self.name,
            state = %state,
            consecutive_successes,
            "Circuit breaker call succeeded"
        );
    }

    fn record_failure(
        &self,
        trial: Option<u64>,
        elapsed: Duration,
        failure: Failure,
        message: &str,
    ) {
        let mut core = self.lock();
        release_trial(&mut core, trial);
        core.stats.failed_calls += 1;
        if failure != Failure::Error {
            core.stats.timeout_calls += 1;
        }
        core.stats.consecutive_failures += 1;
        core.stats.consecutive_successes = 0;
        core.stats.last_failure_time = Some(SystemTime::now());
        core.last_failure_at = Some(Instant::now());

        let tripped = match core.state {
            CircuitState::Closed => {
                core.stats.consecutive_failures >= self.config.failure_threshold
            }
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if tripped {
            self.transition(&mut core, CircuitState::Open);
        }
        let state = core.state;
        let consecutive_failures = core.stats.consecutive_failures;
        drop(core);

        let outcome = if failure == Failure::Error {
            "failure"
        } else {
            "timeout"
        };
        self.observe(elapsed, outcome);
        error!(
            breaker = %self.name,
            state = %state,
            consecutive_failures,
            timeout = failure != Failure::Error,
            cancelled = failure == Failure::Cancelled,
            error = %message,
            "Circuit breaker call failed"
        );
    }

    fn observe(&self, elapsed: Duration, outcome: &str) {
        self.calls
            .inc(1, &[("breaker", &self.name), ("outcome", outcome)]);
        self.durations.observe_duration(elapsed);
        self.latency.add(elapsed.as_secs_f64());
    }

    /// Apply a state change. Callers hold the core lock.
    fn transition(&self, core: &mut BreakerCore, to: CircuitState) {
        if core.state == to {
            return;
        }
        core.state = to;
        match to {
            CircuitState::Open => {
                core.stats.circuit_opened_count += 1;
                self.opens.inc(1, &[("breaker", &self.name)]);
                warn!(
                    breaker = %self.name,
                    consecutive_failures = core.stats.consecutive_failures,
                    circuit_opened_count = core.stats.circuit_opened_count,
                    "Circuit breaker opened due to failures"
                );
            }
            CircuitState::HalfOpen => {
                core.stats.consecutive_successes = 0;
                core.half_open_in_flight = 0;
                core.half_open_generation += 1;
                info!(
                    breaker = %self.name,
                    recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
                    "Circuit breaker transitioning to half-open"
                );
            }
            CircuitState::Closed => {
                core.stats.consecutive_failures = 0;
                info!(
                    breaker = %self.name,
                    consecutive_successes = core.stats.consecutive_successes,
                    "Circuit breaker closed after successful recovery"
                );
            }
        }
        self.state_gauge
            .set(to.as_gauge_value(), &[("breaker", &self.name)]);
    }

    fn lock(&self) -> MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the current circuit state.
    ///
    /// An open circuit stays open here even after the recovery timeout; the
    /// move to half-open happens on the next call.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Get a copy of the current statistics.
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        self.lock().stats.clone()
    }

    /// Get a status snapshot with the echoed configuration.
    #[must_use]
    pub fn status(&self) -> BreakerStatus {
        let (state, stats) = {
            let core = self.lock();
            (core.state, core.stats.clone())
        };
        let success_rate_percent = if stats.total_calls > 0 {
            stats.successful_calls as f64 / stats.total_calls as f64 * 100.0
        } else {
            0.0
        };
        BreakerStatus {
            name: self.name.clone(),
            state,
            stats,
            success_rate_percent,
            config: self.config.clone(),
        }
    }

    /// Manually reset the circuit breaker to closed state.
    ///
    /// Cumulative counters are kept; consecutive counters are cleared.
    pub fn reset(&self) {
        let mut core = self.lock();
        core.state = CircuitState::Closed;
        core.stats.consecutive_failures = 0;
        core.stats.consecutive_successes = 0;
        core.half_open_in_flight = 0;
        core.half_open_generation += 1;
        core.last_failure_at = None;
        drop(core);

        self.state_gauge.set(
            CircuitState::Closed.as_gauge_value(),
            &[("breaker", &self.name)],
        );
        info!(breaker = %self.name, "Circuit breaker manually reset");
    }

    /// Get the time until an open circuit admits a trial call.
    #[must_use]
    pub fn time_until_retry(&self) -> Option<Duration> {
        let core = self.lock();
        if core.state != CircuitState::Open {
            return None;
        }
        Some(core.last_failure_at.map_or(Duration::ZERO, |at| {
            self.config.recovery_timeout.saturating_sub(at.elapsed())
        }))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the circuit breaker configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

/// Frees the slot of a finished trial, unless it was admitted in an earlier
/// half-open period whose slots are already gone.
fn release_trial(core: &mut BreakerCore, trial: Option<u64>) {
    if trial == Some(core.half_open_generation) {
        core.half_open_in_flight = core.half_open_in_flight.saturating_sub(1);
    }
}

/// Settles an admitted call exactly once. Dropping it unsettled means the
/// caller cancelled the call, which is recorded as a timeout failure.
struct InFlight<'a> {
    breaker: &'a CircuitBreaker,
    trial: Option<u64>,
    started: Instant,
    settled: bool,
}

impl InFlight<'_> {
    fn succeed(&mut self) {
        self.settled = true;
        self.breaker
            .record_success(self.trial, self.started.elapsed());
    }

    fn fail(&mut self, failure: Failure, message: &str) {
        self.settled = true;
        self.breaker
            .record_failure(self.trial, self.started.elapsed(), failure, message);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.fail(Failure::Cancelled, "call cancelled before completion");
        }
    }
}
