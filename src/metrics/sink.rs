// SPDX-License-Identifier: MIT OR Apache-2.0

use super::primitives::{
    Counter, Gauge, Histogram, HistogramSnapshot, SlidingWindow, WindowStats, DEFAULT_BUCKETS,
    DEFAULT_WINDOW,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Counter: calls through a breaker, labeled by `breaker` and `outcome`.
pub const BREAKER_CALLS: &str = "circuit_breaker_calls";
/// Counter: transitions into the open state, labeled by `breaker`.
pub const BREAKER_OPENS: &str = "circuit_breaker_opens";
/// Gauge: breaker state (0=closed, 1=half-open, 2=open), labeled by `breaker`.
pub const BREAKER_STATE: &str = "circuit_breaker_state";
/// Histogram: duration of invoked calls in seconds.
pub const BREAKER_CALL_DURATION: &str = "circuit_breaker_call_duration";
/// Sliding window: recent call latencies in seconds.
pub const BREAKER_LATENCY: &str = "circuit_breaker_latency";
/// Counter: attempts made by retry executors, labeled by `executor`.
pub const RETRY_ATTEMPTS: &str = "retry_attempts";
/// Counter: retry cycles that ended in failure, labeled by `executor`.
pub const RETRY_EXHAUSTED: &str = "retry_exhausted";
/// Histogram: backoff delays in seconds.
pub const RETRY_DELAY: &str = "retry_delay";

/// Process-wide store of named metrics.
///
/// Registration is idempotent: registering an existing name returns the
/// instrument already stored under it.
#[derive(Debug)]
pub struct MetricsSink {
    counters: RwLock<HashMap<String, Arc<Counter>>>,
    gauges: RwLock<HashMap<String, Arc<Gauge>>>,
    histograms: RwLock<HashMap<String, Arc<Histogram>>>,
    windows: RwLock<HashMap<String, Arc<SlidingWindow>>>,
}

impl MetricsSink {
    /// Create a sink with the core resilience metrics registered.
    pub fn new() -> Self {
        let sink = Self::empty();
        sink.register_counter(BREAKER_CALLS, "Calls through circuit breakers");
        sink.register_counter(BREAKER_OPENS, "Circuit breaker opens");
        sink.register_gauge(
            BREAKER_STATE,
            "Circuit breaker state (0=closed, 1=half-open, 2=open)",
        );
        sink.register_histogram(
            BREAKER_CALL_DURATION,
            "Circuit breaker call duration in seconds",
            None,
        );
        sink.register_sliding_window(BREAKER_LATENCY, DEFAULT_WINDOW);
        sink.register_counter(RETRY_ATTEMPTS, "Total retry executor attempts");
        sink.register_counter(RETRY_EXHAUSTED, "Retry cycles that ended in failure");
        sink.register_histogram(RETRY_DELAY, "Retry delay in seconds", None);
        debug!("Core metrics initialized");
        sink
    }

    /// Create a sink with nothing registered.
    pub fn empty() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_counter(&self, name: &str, description: &str) -> Arc<Counter> {
        get_or_insert(&self.counters, name, || Counter::new(name, description))
    }

    pub fn register_gauge(&self, name: &str, description: &str) -> Arc<Gauge> {
        get_or_insert(&self.gauges, name, || Gauge::new(name, description))
    }

    /// Register a histogram; `None` selects [`DEFAULT_BUCKETS`].
    pub fn register_histogram(
        &self,
        name: &str,
        description: &str,
        buckets: Option<&[f64]>,
    ) -> Arc<Histogram> {
        get_or_insert(&self.histograms, name, || {
            Histogram::new(name, description, buckets.unwrap_or(&DEFAULT_BUCKETS[..]))
        })
    }

    pub fn register_sliding_window(&self, name: &str, window: Duration) -> Arc<SlidingWindow> {
        get_or_insert(&self.windows, name, || SlidingWindow::new(window))
    }

    #[must_use]
    pub fn counter(&self, name: &str) -> Option<Arc<Counter>> {
        lookup(&self.counters, name)
    }

    #[must_use]
    pub fn gauge(&self, name: &str) -> Option<Arc<Gauge>> {
        lookup(&self.gauges, name)
    }

    #[must_use]
    pub fn histogram(&self, name: &str) -> Option<Arc<Histogram>> {
        lookup(&self.histograms, name)
    }

    #[must_use]
    pub fn sliding_window(&self, name: &str) -> Option<Arc<SlidingWindow>> {
        lookup(&self.windows, name)
    }

    /// Plain-data view of every registered metric.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, c)| {
                (
                    name.clone(),
                    CounterSnapshot {
                        description: c.description().to_string(),
                        values: c.values(),
                    },
                )
            })
            .collect();

        let gauges = self
            .gauges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, g)| {
                (
                    name.clone(),
                    GaugeSnapshot {
                        description: g.description().to_string(),
                        values: g.values(),
                    },
                )
            })
            .collect();

        let histograms = self
            .histograms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, h)| (name.clone(), h.snapshot()))
            .collect();

        let sliding_windows = self
            .windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, w)| (name.clone(), w.stats()))
            .collect();

        MetricsSnapshot {
            timestamp: SystemTime::now(),
            counters,
            gauges,
            histograms,
            sliding_windows,
        }
    }
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

fn get_or_insert<T>(
    map: &RwLock<HashMap<String, Arc<T>>>,
    name: &str,
    create: impl FnOnce() -> T,
) -> Arc<T> {
    if let Some(existing) = lookup(map, name) {
        return existing;
    }
    let mut map = map.write().unwrap_or_else(PoisonError::into_inner);
    map.entry(name.to_string())
        .or_insert_with(|| Arc::new(create()))
        .clone()
}

fn lookup<T>(map: &RwLock<HashMap<String, Arc<T>>>, name: &str) -> Option<Arc<T>> {
    map.read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .cloned()
}

#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub description: String,
    pub values: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GaugeSnapshot {
    pub description: String,
    pub values: BTreeMap<String, f64>,
}

/// Snapshot of all metrics in a sink.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: SystemTime,
    pub counters: BTreeMap<String, CounterSnapshot>,
    pub gauges: BTreeMap<String, GaugeSnapshot>,
    pub histograms: BTreeMap<String, HistogramSnapshot>,
    pub sliding_windows: BTreeMap<String, WindowStats>,
}
