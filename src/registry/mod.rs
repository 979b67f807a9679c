// SPDX-License-Identifier: MIT OR Apache-2.0

//! Name-keyed registry of circuit breakers and retry executors.
//!
//! The registry is the entry point for callers: it creates components on
//! first use, hands out shared instances afterwards, and composes them so
//! the breaker observes the outcome of a whole retry cycle.
//!
//! # Example
//!
//! ```no_run
//! use resilience_rs::{ResilienceError, ResilienceRegistry};
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let registry = ResilienceRegistry::new();
//!
//! let page = registry
//!     .execute("search", || async { Ok::<_, ResilienceError>("<html/>") })
//!     .await?;
//!
//! for name in registry.status().open_breakers() {
//!     println!("{name} is rejecting calls");
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::ResilienceSettings;
use crate::error::Result;
use crate::metrics::MetricsSink;
use crate::runtime::{
    BreakerStatus, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryExecutor,
    RetryPolicy, RetryStatus,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;
use tracing::{debug, info};

/// Configuration for a breaker/executor pair.
#[derive(Debug, Clone, Default)]
pub struct GuardConfig {
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
}

impl GuardConfig {
    #[must_use]
    pub fn new(breaker: CircuitBreakerConfig, retry: RetryPolicy) -> Self {
        Self { breaker, retry }
    }
}

/// A breaker and the executor it guards.
#[derive(Debug, Clone)]
pub struct Guard {
    pub breaker: Arc<CircuitBreaker>,
    pub executor: Arc<RetryExecutor>,
}

impl Guard {
    /// Run `operation` under the executor, guarded by the breaker.
    ///
    /// An open breaker rejects the call before the executor makes any attempt.
    ///
    /// # Errors
    ///
    /// Returns `ResilienceError::CircuitOpen` when short-circuited, the
    /// breaker's `Timeout` when the whole cycle exceeds the call deadline, and
    /// otherwise the last error of the retry cycle.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breaker.call(|| self.executor.run(operation)).await
    }
}

/// Components registered under one name; either side may be absent when
/// breakers and executors are created independently.
#[derive(Debug, Clone, Default)]
pub struct GuardHandles {
    pub breaker: Option<Arc<CircuitBreaker>>,
    pub executor: Option<Arc<RetryExecutor>>,
}

/// Plain-data status of every registered component.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub timestamp: SystemTime,
    pub breakers: BTreeMap<String, BreakerStatus>,
    pub executors: BTreeMap<String, RetryStatus>,
}

impl RegistryStatus {
    /// Names of breakers that are not closed.
    #[must_use]
    pub fn open_breakers(&self) -> Vec<&str> {
        self.breakers
            .iter()
            .filter(|(_, status)| status.state != CircuitState::Closed)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.breakers
            .values()
            .any(|status| status.state != CircuitState::Closed)
    }
}

/// Registry of named circuit breakers and retry executors.
#[derive(Debug)]
pub struct ResilienceRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    executors: RwLock<HashMap<String, Arc<RetryExecutor>>>,
    metrics: Arc<MetricsSink>,
    settings: ResilienceSettings,
}

impl ResilienceRegistry {
    /// Create an empty registry with its own metrics sink.
    #[must_use]
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(MetricsSink::new()))
    }

    /// Create an empty registry reporting into `metrics`.
    #[must_use]
    pub fn with_metrics(metrics: Arc<MetricsSink>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            executors: RwLock::new(HashMap::new()),
            metrics,
            settings: ResilienceSettings::default(),
        }
    }

    /// Create a registry that configures components from `settings` when
    /// callers pass no explicit configuration.
    #[must_use]
    pub fn from_settings(settings: ResilienceSettings) -> Self {
        Self {
            settings,
            ..Self::new()
        }
    }

    /// Get the breaker named `name`, creating it on first use.
    ///
    /// `config` only applies on creation; without it the settings entry for
    /// `name` is used.
    ///
    /// # Errors
    ///
    /// Returns `ResilienceError::Config` if a new breaker's configuration is invalid.
    pub fn breaker(
        &self,
        name: &str,
        config: Option<CircuitBreakerConfig>,
    ) -> Result<Arc<CircuitBreaker>> {
        if let Some(existing) = read(&self.breakers).get(name) {
            return Ok(existing.clone());
        }

        let config = match config {
            Some(config) => config,
            None => self.settings.breaker_config(name)?,
        };
        config.validate()?;

        let breaker = write(&self.breakers)
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(breaker = %name, "Registering circuit breaker");
                Arc::new(CircuitBreaker::new(name, config, self.metrics.clone()))
            })
            .clone();
        Ok(breaker)
    }

    /// Get the retry executor named `name`, creating it on first use.
    ///
    /// `policy` only applies on creation; without it the settings entry for
    /// `name` is used.
    ///
    /// # Errors
    ///
    /// Returns `ResilienceError::Config` if a new executor's policy is invalid.
    pub fn executor(&self, name: &str, policy: Option<RetryPolicy>) -> Result<Arc<RetryExecutor>> {
        if let Some(existing) = read(&self.executors).get(name) {
            return Ok(existing.clone());
        }

        let policy = match policy {
            Some(policy) => policy,
            None => self.settings.retry_policy(name)?,
        };
        policy.validate()?;

        let executor = write(&self.executors)
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(executor = %name, "Registering retry executor");
                Arc::new(RetryExecutor::new(name, policy, self.metrics.clone()))
            })
            .clone();
        Ok(executor)
    }

    /// Get the breaker and executor named `name`, creating them on first use.
    ///
    /// # Errors
    ///
    /// Returns `ResilienceError::Config` if a new component's configuration is invalid.
    pub fn get_or_create(&self, name: &str, config: Option<GuardConfig>) -> Result<Guard> {
        let (breaker, retry) = match config {
            Some(config) => (Some(config.breaker), Some(config.retry)),
            None => (None, None),
        };
        Ok(Guard {
            breaker: self.breaker(name, breaker)?,
            executor: self.executor(name, retry)?,
        })
    }

    /// Run `operation` through the breaker and executor named `name`.
    ///
    /// # Errors
    ///
    /// See [`Guard::call`]; also `ResilienceError::Config` if the components
    /// cannot be created.
    pub async fn execute<F, Fut, T>(&self, name: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.get_or_create(name, None)?;
        guard.call(operation).await
    }

    /// All registered components by name.
    #[must_use]
    pub fn list_all(&self) -> BTreeMap<String, GuardHandles> {
        let mut all: BTreeMap<String, GuardHandles> = BTreeMap::new();
        for (name, breaker) in read(&self.breakers).iter() {
            all.entry(name.clone()).or_default().breaker = Some(breaker.clone());
        }
        for (name, executor) in read(&self.executors).iter() {
            all.entry(name.clone()).or_default().executor = Some(executor.clone());
        }
        all
    }

    /// Status snapshot of every registered component.
    #[must_use]
    pub fn status(&self) -> RegistryStatus {
        let breakers = read(&self.breakers)
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.status()))
            .collect();
        let executors = read(&self.executors)
            .iter()
            .map(|(name, executor)| (name.clone(), executor.status()))
            .collect();
        RegistryStatus {
            timestamp: SystemTime::now(),
            breakers,
            executors,
        }
    }

    /// Remove the components named `name`. Returns whether anything was removed.
    ///
    /// Handles already given out keep working; the next lookup creates fresh
    /// instances.
    pub fn remove(&self, name: &str) -> bool {
        let breaker = write(&self.breakers).remove(name).is_some();
        let executor = write(&self.executors).remove(name).is_some();
        if breaker || executor {
            info!(name = %name, "Removed resilience components");
        }
        breaker || executor
    }

    /// Remove every registered component.
    pub fn clear(&self) {
        write(&self.breakers).clear();
        write(&self.executors).clear();
        info!("Cleared resilience registry");
    }

    /// The metrics sink shared by all components.
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsSink> {
        &self.metrics
    }

    #[must_use]
    pub fn settings(&self) -> &ResilienceSettings {
        &self.settings
    }
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, ResilienceError};
    use crate::metrics::{BREAKER_CALLS, RETRY_ATTEMPTS};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn quick_config(failure_threshold: u64) -> GuardConfig {
        GuardConfig::new(
            CircuitBreakerConfig::new().with_failure_threshold(failure_threshold),
            RetryPolicy::new()
                .with_max_attempts(2)
                .with_base_delay(Duration::from_millis(100))
                .with_jitter(false),
        )
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = ResilienceRegistry::new();
        let first = registry.get_or_create("search", Some(quick_config(2))).unwrap();
        let second = registry.get_or_create("search", Some(quick_config(9))).unwrap();

        assert!(Arc::ptr_eq(&first.breaker, &second.breaker));
        assert!(Arc::ptr_eq(&first.executor, &second.executor));
        // The second config is ignored
        assert_eq!(second.breaker.config().failure_threshold, 2);
    }

    #[test]
    fn test_default_configs_without_settings() {
        let registry = ResilienceRegistry::new();
        let guard = registry.get_or_create("search", None).unwrap();
        assert_eq!(guard.breaker.config(), &CircuitBreakerConfig::default());
        assert_eq!(guard.executor.policy().max_attempts, 3);
    }

    #[test]
    fn test_from_settings_uses_named_entries() {
        let settings = ResilienceSettings::from_yaml(
            "breakers:\n  search:\n    failure_threshold: 3\n    recovery_timeout: 120\n\
             retries:\n  search:\n    preset: aggressive\n",
        )
        .unwrap();
        let registry = ResilienceRegistry::from_settings(settings);

        let guard = registry.get_or_create("search", None).unwrap();
        assert_eq!(guard.breaker.config().failure_threshold, 3);
        assert_eq!(
            guard.breaker.config().recovery_timeout,
            Duration::from_secs(120)
        );
        assert_eq!(guard.executor.policy().max_attempts, 5);

        // Explicit configuration wins over the file
        let explicit = registry
            .breaker("other", Some(CircuitBreakerConfig::new().with_failure_threshold(7)))
            .unwrap();
        assert_eq!(explicit.config().failure_threshold, 7);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let registry = ResilienceRegistry::new();
        let err = registry
            .breaker("bad", Some(CircuitBreakerConfig::new().with_failure_threshold(0)))
            .unwrap_err();
        assert!(matches!(err, ResilienceError::Config(_)));
        assert!(registry.list_all().is_empty());
    }

    #[test]
    fn test_independent_names() {
        let registry = ResilienceRegistry::new();
        registry.breaker("scraper", None).unwrap();
        registry.executor("scraper_operations", None).unwrap();

        let all = registry.list_all();
        assert_eq!(all.len(), 2);
        assert!(all["scraper"].breaker.is_some());
        assert!(all["scraper"].executor.is_none());
        assert!(all["scraper_operations"].executor.is_some());
    }

    #[tokio::test]
    async fn test_execute_success() {
        let registry = ResilienceRegistry::new();
        let value = registry.execute("search", || async { Ok(7) }).await.unwrap();

        assert_eq!(value, 7);
        let status = registry.status();
        assert_eq!(status.breakers["search"].stats.successful_calls, 1);
        assert_eq!(status.executors["search"].stats.total_attempts, 1);
        assert!(!status.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_retry_cycle() {
        let registry = ResilienceRegistry::new();
        let guard = registry.get_or_create("search", Some(quick_config(1))).unwrap();
        let calls = AtomicU32::new(0);

        let first: Result<()> = guard
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ResilienceError::Connection("down".to_string()))
            })
            .await;
        assert!(matches!(first, Err(ResilienceError::Connection(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(guard.breaker.state(), CircuitState::Open);

        let before = tokio::time::Instant::now();
        let second: Result<()> = guard
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(second.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(guard.executor.stats().total_attempts, 2);
        assert_eq!(before.elapsed(), Duration::ZERO);

        let status = registry.status();
        assert!(status.is_degraded());
        assert_eq!(status.open_breakers(), vec!["search"]);
    }

    #[tokio::test]
    async fn test_fatal_error_counts_once_against_breaker() {
        let registry = ResilienceRegistry::new();
        let guard = registry.get_or_create("search", Some(quick_config(5))).unwrap();

        let result: Result<()> = guard
            .call(|| async { Err(ResilienceError::operation(ErrorKind::InvalidInput, "plate")) })
            .await;

        assert!(result.is_err());
        assert_eq!(guard.executor.stats().total_attempts, 1);
        assert_eq!(guard.breaker.stats().failed_calls, 1);
        assert_eq!(guard.breaker.stats().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_shared_metrics() {
        let metrics = Arc::new(MetricsSink::new());
        let registry = ResilienceRegistry::with_metrics(metrics.clone());

        registry.execute("a", || async { Ok(()) }).await.unwrap();
        registry.execute("b", || async { Ok(()) }).await.unwrap();

        let calls = metrics.counter(BREAKER_CALLS).unwrap();
        assert_eq!(calls.get(&[]), 2);
        assert_eq!(calls.get(&[("breaker", "a"), ("outcome", "success")]), 1);
        assert_eq!(
            metrics.counter(RETRY_ATTEMPTS).unwrap().get(&[("executor", "b")]),
            1
        );
        assert!(Arc::ptr_eq(registry.metrics(), &metrics));
    }

    #[test]
    fn test_remove_and_clear() {
        let registry = ResilienceRegistry::new();
        let old = registry.get_or_create("search", None).unwrap();
        registry.get_or_create("detail", None).unwrap();

        assert!(registry.remove("search"));
        assert!(!registry.remove("search"));
        assert_eq!(registry.list_all().len(), 1);

        let fresh = registry.get_or_create("search", None).unwrap();
        assert!(!Arc::ptr_eq(&old.breaker, &fresh.breaker));

        registry.clear();
        assert!(registry.list_all().is_empty());
        assert!(registry.status().breakers.is_empty());
    }
}
