// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry policies and the exponential-backoff retry executor.
//!
//! A [`RetryExecutor`] runs an async operation up to `max_attempts` times.
//! Each failure is classified against the policy's fatal set first, then its
//! retryable set; anything matching neither is not retried.
//!
//! # Example
//!
//! ```
//! use resilience_rs::ErrorKind;
//! use resilience_rs::runtime::{ErrorMatcher, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new()
//!     .with_max_attempts(3)
//!     .with_base_delay(Duration::from_secs(1))
//!     .with_max_delay(Duration::from_secs(10))
//!     .with_jitter(false)
//!     .with_retryable(ErrorMatcher::new([ErrorKind::Connection, ErrorKind::Timeout]));
//!
//! assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
//! assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
//! ```

use crate::error::{ErrorKind, ResilienceError, Result};
use crate::metrics::{Counter, Histogram, MetricsSink, RETRY_ATTEMPTS, RETRY_DELAY, RETRY_EXHAUSTED};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Smallest delay a jittered backoff may produce.
pub const MIN_JITTERED_DELAY: Duration = Duration::from_millis(100);

type Predicate = Arc<dyn Fn(&ResilienceError) -> bool + Send + Sync>;

// =============================================================================
// Error Matching
// =============================================================================

/// Matches errors by kind tag, or by a caller-supplied predicate.
#[derive(Clone, Default, Serialize)]
pub struct ErrorMatcher {
    kinds: Vec<ErrorKind>,
    #[serde(skip)]
    predicate: Option<Predicate>,
}

impl ErrorMatcher {
    /// Match any of the given kinds.
    pub fn new(kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            predicate: None,
        }
    }

    /// Match nothing.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Additionally match errors for which `predicate` returns `true`.
    #[must_use]
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ResilienceError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    #[must_use]
    pub fn matches(&self, err: &ResilienceError) -> bool {
        self.kinds.contains(&err.kind()) || self.predicate.as_ref().is_some_and(|p| p(err))
    }

    #[must_use]
    pub fn kinds(&self) -> &[ErrorKind] {
        &self.kinds
    }
}

impl fmt::Debug for ErrorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorMatcher")
            .field("kinds", &self.kinds)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// How a failed attempt is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Matched the fatal set; stop immediately.
    Fatal,
    /// Matched the retryable set; retry while attempts remain.
    Retryable,
    /// Matched neither set; not retried.
    Unclassified,
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Backoff and classification settings for a retry executor.
#[derive(Debug, Clone, Serialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Perturb delays by a random offset.
    pub jitter_enabled: bool,
    /// Jitter as a fraction of the delay (0.1 = +/-10%).
    pub jitter_range: f64,
    /// Stop retrying once a cycle has run this long.
    pub total_timeout: Option<Duration>,
    /// Errors that consume an attempt and trigger backoff.
    pub retryable: ErrorMatcher,
    /// Errors that stop the cycle immediately.
    pub fatal: ErrorMatcher,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            jitter_range: 0.1,
            total_timeout: None,
            retryable: ErrorMatcher::new([ErrorKind::Connection, ErrorKind::Timeout]),
            fatal: ErrorMatcher::new([ErrorKind::InvalidInput, ErrorKind::Config]),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Two attempts, gentle backoff.
    #[must_use]
    pub fn conservative() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// Five attempts with a slower-growing backoff.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 1.5,
            ..Self::default()
        }
    }

    /// Retries transport-level failures of a remote call; gives up at once on
    /// answers that will not change.
    #[must_use]
    pub fn network() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            retryable: ErrorMatcher::new([
                ErrorKind::Connection,
                ErrorKind::Timeout,
                ErrorKind::Io,
                ErrorKind::Unavailable,
                ErrorKind::Transient,
            ]),
            fatal: ErrorMatcher::new([
                ErrorKind::NotFound,
                ErrorKind::DataIntegrity,
                ErrorKind::InvalidInput,
                ErrorKind::Config,
            ]),
            ..Self::default()
        }
    }

    /// Set the maximum number of attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the multiplier for exponential growth.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_jitter_range(mut self, range: f64) -> Self {
        self.jitter_range = range;
        self
    }

    /// Set the total time budget for one retry cycle.
    #[must_use]
    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_retryable(mut self, matcher: ErrorMatcher) -> Self {
        self.retryable = matcher;
        self
    }

    #[must_use]
    pub fn with_fatal(mut self, matcher: ErrorMatcher) -> Self {
        self.fatal = matcher;
        self
    }

    /// Check attempt count, delays and jitter settings.
    ///
    /// # Errors
    ///
    /// Returns `ResilienceError::Config` naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(ResilienceError::Config(
                "max_delay must not be smaller than base_delay".to_string(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ResilienceError::Config(
                "backoff_multiplier must be a finite number >= 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_range) {
            return Err(ResilienceError::Config(
                "jitter_range must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    /// Classify an error: fatal set first, then retryable set.
    #[must_use]
    pub fn classify(&self, err: &ResilienceError) -> Classification {
        if self.fatal.matches(err) {
            Classification::Fatal
        } else if self.retryable.matches(err) {
            Classification::Retryable
        } else {
            Classification::Unclassified
        }
    }

    /// Delay applied after failed attempt `attempt` (1-indexed), before the next one.
    ///
    /// Without jitter this is `min(base_delay * multiplier^(attempt-1), max_delay)`.
    /// With jitter the value is moved by up to `jitter_range` of itself in either
    /// direction, floored at [`MIN_JITTERED_DELAY`] and still capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let max_secs = self.max_delay.as_secs_f64();
        let mut delay =
            (self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent)).min(max_secs);

        if self.jitter_enabled {
            let amount = delay * self.jitter_range;
            let offset = (rand::random::<f64>() * 2.0 - 1.0) * amount;
            delay = (delay + offset)
                .max(MIN_JITTERED_DELAY.as_secs_f64())
                .min(max_secs);
        }

        Duration::try_from_secs_f64(delay).unwrap_or(self.max_delay)
    }
}

// =============================================================================
// Retry Executor
// =============================================================================

/// Aggregate counters kept by a retry executor.
///
/// `successful_attempts` and `failed_attempts` count whole cycles by outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryStats {
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub failed_attempts: u64,
    pub total_retries: u64,
    pub average_attempts: f64,
}

/// Status snapshot of a retry executor.
#[derive(Debug, Clone, Serialize)]
pub struct RetryStatus {
    pub name: String,
    pub stats: RetryStats,
    pub policy: RetryPolicy,
}

/// Runs an operation with retries according to a [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryExecutor {
    name: String,
    policy: RetryPolicy,
    stats: Mutex<RetryStats>,
    attempts: Arc<Counter>,
    exhausted: Arc<Counter>,
    delays: Arc<Histogram>,
}

impl RetryExecutor {
    /// Create an executor reporting into `metrics`.
    pub fn new(name: impl Into<String>, policy: RetryPolicy, metrics: Arc<MetricsSink>) -> Self {
        Self {
            name: name.into(),
            policy,
            stats: Mutex::new(RetryStats::default()),
            attempts: metrics.register_counter(RETRY_ATTEMPTS, "Total retry executor attempts"),
            exhausted: metrics
                .register_counter(RETRY_EXHAUSTED, "Retry cycles that ended in failure"),
            delays: metrics.register_histogram(RETRY_DELAY, "Retry delay in seconds", None),
        }
    }

    /// Create an executor with the default policy and its own metrics sink.
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, RetryPolicy::default(), Arc::new(MetricsSink::new()))
    }

    /// Execute an async operation with retry logic.
    ///
    /// # Errors
    ///
    /// Returns the last error produced by the operation, unchanged, once the
    /// error is fatal or unclassified, attempts are exhausted, or the total
    /// timeout has elapsed.
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut cycle = Cycle {
            executor: self,
            started: Instant::now(),
            attempts: 0,
            finished: false,
        };

        loop {
            cycle.attempts += 1;
            let attempt = cycle.attempts;
            self.record_attempt();
            debug!(executor = %self.name, attempt, max_attempts, "Executing operation");

            let err = match operation().await {
                Ok(value) => {
                    cycle.finish(true);
                    if attempt > 1 {
                        info!(
                            executor = %self.name,
                            total_attempts = attempt,
                            retries_used = attempt - 1,
                            elapsed_ms = cycle.started.elapsed().as_millis() as u64,
                            "Operation succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            warn!(
                executor = %self.name,
                attempt,
                kind = %err.kind(),
                error = %err,
                "Operation failed"
            );

            let retry = match self.policy.classify(&err) {
                Classification::Fatal => {
                    debug!(executor = %self.name, kind = %err.kind(), "Not retrying fatal error");
                    false
                }
                Classification::Unclassified => {
                    debug!(
                        executor = %self.name,
                        kind = %err.kind(),
                        "Not retrying unclassified error"
                    );
                    false
                }
                Classification::Retryable => {
                    attempt < max_attempts
                        && !self
                            .policy
                            .total_timeout
                            .is_some_and(|budget| cycle.started.elapsed() >= budget)
                }
            };

            if !retry {
                cycle.finish(false);
                error!(
                    executor = %self.name,
                    total_attempts = attempt,
                    elapsed_ms = cycle.started.elapsed().as_millis() as u64,
                    kind = %err.kind(),
                    error = %err,
                    "Operation failed after retries"
                );
                return Err(err);
            }

            let delay = self.delay_for_attempt(attempt);
            info!(
                executor = %self.name,
                attempt,
                next_attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Retrying after delay"
            );
            self.delays.observe_duration(delay);
            tokio::time::sleep(delay).await;
            self.lock().total_retries += 1;
        }
    }

    fn record_attempt(&self) {
        self.lock().total_attempts += 1;
        self.attempts.inc(1, &[("executor", &self.name)]);
    }

    fn record_outcome(&self, success: bool) {
        let mut stats = self.lock();
        if success {
            stats.successful_attempts += 1;
        } else {
            stats.failed_attempts += 1;
        }
        let cycles = stats.successful_attempts + stats.failed_attempts;
        stats.average_attempts = stats.total_attempts as f64 / cycles as f64;
        drop(stats);

        if !success {
            self.exhausted.inc(1, &[("executor", &self.name)]);
        }
    }

    fn lock(&self) -> MutexGuard<'_, RetryStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a copy of the current statistics.
    #[must_use]
    pub fn stats(&self) -> RetryStats {
        self.lock().clone()
    }

    /// Get a status snapshot with the echoed policy.
    #[must_use]
    pub fn status(&self) -> RetryStatus {
        RetryStatus {
            name: self.name.clone(),
            stats: self.stats(),
            policy: self.policy.clone(),
        }
    }

    /// Delay this executor waits after failed attempt `attempt`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.policy.delay_for_attempt(attempt)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

/// Records the outcome of one retry cycle exactly once; a cycle dropped
/// before finishing counts as failed.
struct Cycle<'a> {
    executor: &'a RetryExecutor,
    started: Instant,
    attempts: u32,
    finished: bool,
}

impl Cycle<'_> {
    fn finish(&mut self, success: bool) {
        self.finished = true;
        self.executor.record_outcome(success);
    }
}

impl Drop for Cycle<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                executor = %self.executor.name,
                attempts = self.attempts,
                "Retry cycle cancelled"
            );
            self.finish(false);
        }
    }
}
