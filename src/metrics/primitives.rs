// SPDX-License-Identifier: MIT OR Apache-2.0

//! Concurrency-safe metric primitives.
//!
//! Every primitive can be shared behind an `Arc` and updated from any task.
//! Counters and histograms are lock-free on the hot path; label maps and
//! sliding windows take a short, synchronous lock that is never held across
//! an `.await`.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Default histogram bucket upper bounds, in seconds.
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Default sliding window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);

/// Build the canonical key for a label set: pairs sorted by name, joined as
/// `k1=v1,k2=v2`.
#[must_use]
pub fn labels_key(labels: &[(&str, &str)]) -> String {
    let mut pairs: Vec<_> = labels.to_vec();
    pairs.sort_unstable();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

// =============================================================================
// Counter
// =============================================================================

/// Monotonic counter with an unlabeled total and per-label-set values.
#[derive(Debug)]
pub struct Counter {
    name: String,
    description: String,
    total: AtomicU64,
    labeled: RwLock<HashMap<String, AtomicU64>>,
}

impl Counter {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            total: AtomicU64::new(0),
            labeled: RwLock::new(HashMap::new()),
        }
    }

    /// Add `delta` to the total, and to the label-set value when `labels` is non-empty.
    pub fn inc(&self, delta: u64, labels: &[(&str, &str)]) {
        self.total.fetch_add(delta, Ordering::Relaxed);
        if labels.is_empty() {
            return;
        }

        let key = labels_key(labels);
        {
            let values = self.labeled.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(value) = values.get(&key) {
                value.fetch_add(delta, Ordering::Relaxed);
                return;
            }
        }
        let mut values = self.labeled.write().unwrap_or_else(PoisonError::into_inner);
        values
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Current value; the unlabeled total when `labels` is empty.
    #[must_use]
    pub fn get(&self, labels: &[(&str, &str)]) -> u64 {
        if labels.is_empty() {
            return self.total.load(Ordering::Relaxed);
        }
        let values = self.labeled.read().unwrap_or_else(PoisonError::into_inner);
        values
            .get(&labels_key(labels))
            .map_or(0, |v| v.load(Ordering::Relaxed))
    }

    /// All values keyed by label key, plus the unlabeled total under `"total"`.
    #[must_use]
    pub fn values(&self) -> BTreeMap<String, u64> {
        let values = self.labeled.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: BTreeMap<String, u64> = values
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        out.insert("total".to_string(), self.total.load(Ordering::Relaxed));
        out
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }
}

// =============================================================================
// Gauge
// =============================================================================

#[derive(Debug, Default)]
struct GaugeValues {
    value: f64,
    labeled: HashMap<String, f64>,
}

/// Gauge holding a current value plus per-label-set values.
#[derive(Debug)]
pub struct Gauge {
    name: String,
    description: String,
    values: Mutex<GaugeValues>,
}

impl Gauge {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            values: Mutex::new(GaugeValues::default()),
        }
    }

    /// Set the value. With labels, both the label-set value and the unlabeled
    /// value take the last write.
    pub fn set(&self, value: f64, labels: &[(&str, &str)]) {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.value = value;
        if !labels.is_empty() {
            values.labeled.insert(labels_key(labels), value);
        }
    }

    pub fn inc(&self, delta: f64, labels: &[(&str, &str)]) {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.value += delta;
        if !labels.is_empty() {
            *values.labeled.entry(labels_key(labels)).or_insert(0.0) += delta;
        }
    }

    pub fn dec(&self, delta: f64, labels: &[(&str, &str)]) {
        self.inc(-delta, labels);
    }

    #[must_use]
    pub fn get(&self, labels: &[(&str, &str)]) -> f64 {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        if labels.is_empty() {
            values.value
        } else {
            values
                .labeled
                .get(&labels_key(labels))
                .copied()
                .unwrap_or(0.0)
        }
    }

    #[must_use]
    pub fn values(&self) -> BTreeMap<String, f64> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: BTreeMap<String, f64> = values
            .labeled
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        out.insert("total".to_string(), values.value);
        out
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }
}

// =============================================================================
// Histogram
// =============================================================================

/// A histogram bucket in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketCount {
    pub upper_bound: f64,
    pub count: u64,
}

/// Point-in-time view of a histogram.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    pub avg: f64,
    pub buckets: Vec<BucketCount>,
}

/// Histogram with cumulative bucket counters.
#[derive(Debug)]
pub struct Histogram {
    name: String,
    description: String,
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum: AtomicU64, // f64 bits
    count: AtomicU64,
}

impl Histogram {
    /// Create a histogram. Bounds are sorted and deduplicated; NaN bounds are dropped.
    pub fn new(name: impl Into<String>, description: impl Into<String>, buckets: &[f64]) -> Self {
        let mut buckets: Vec<f64> = buckets.iter().copied().filter(|b| !b.is_nan()).collect();
        buckets.sort_by(f64::total_cmp);
        buckets.dedup();
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            name: name.into(),
            description: description.into(),
            buckets,
            counts,
            sum: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    pub fn with_default_buckets(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, description, &DEFAULT_BUCKETS)
    }

    /// Record an observation in every bucket whose upper bound is >= `value`.
    pub fn observe(&self, value: f64) {
        for (i, bucket) in self.buckets.iter().enumerate() {
            if value <= *bucket {
                for count in &self.counts[i..] {
                    count.fetch_add(1, Ordering::Relaxed);
                }
                break;
            }
        }

        // fetch_update only fails when the closure returns None
        let _ = self
            .sum
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a duration in seconds.
    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64());
    }

    /// Start a timer that observes its elapsed time when dropped.
    #[must_use]
    pub fn start_timer(&self) -> Timer<'_> {
        Timer {
            histogram: self,
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        let count = self.count();
        let sum = self.sum();
        HistogramSnapshot {
            count,
            sum,
            avg: if count > 0 { sum / count as f64 } else { 0.0 },
            buckets: self
                .buckets
                .iter()
                .zip(&self.counts)
                .map(|(upper_bound, c)| BucketCount {
                    upper_bound: *upper_bound,
                    count: c.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Observes the time since its creation into a histogram on drop.
#[derive(Debug)]
pub struct Timer<'a> {
    histogram: &'a Histogram,
    start: Instant,
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.histogram.observe_duration(self.start.elapsed());
    }
}

// =============================================================================
// Sliding Window
// =============================================================================

/// Aggregates over the entries currently inside a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct WindowStats {
    pub count: usize,
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

/// Time-ordered values, pruned by age on every write and read.
#[derive(Debug)]
pub struct SlidingWindow {
    window: Duration,
    data: Mutex<VecDeque<(Instant, f64)>>,
}

impl SlidingWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            data: Mutex::new(VecDeque::new()),
        }
    }

    pub fn add(&self, value: f64) {
        self.add_at(value, Instant::now());
    }

    /// Add a value observed at `at`.
    pub fn add_at(&self, value: f64, at: Instant) {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.push_back((at, value));
        Self::prune(&mut data, self.window);
    }

    /// Values observed at or after `since` that are still inside the window.
    #[must_use]
    pub fn values_since(&self, since: Instant) -> Vec<f64> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Self::prune(&mut data, self.window);
        data.iter()
            .filter(|(ts, _)| *ts >= since)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Recompute count/sum/avg/min/max over the surviving entries.
    #[must_use]
    pub fn stats(&self) -> WindowStats {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Self::prune(&mut data, self.window);
        if data.is_empty() {
            return WindowStats::default();
        }

        let mut stats = WindowStats {
            count: data.len(),
            sum: 0.0,
            avg: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        };
        for (_, value) in data.iter() {
            stats.sum += value;
            stats.min = stats.min.min(*value);
            stats.max = stats.max.max(*value);
        }
        stats.avg = stats.sum / stats.count as f64;
        stats
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    fn prune(data: &mut VecDeque<(Instant, f64)>, window: Duration) {
        let now = Instant::now();
        data.retain(|(ts, _)| now.saturating_duration_since(*ts) <= window);
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_labels_key_is_sorted() {
        assert_eq!(
            labels_key(&[("region", "a"), ("outcome", "ok")]),
            "outcome=ok,region=a"
        );
        assert_eq!(labels_key(&[]), "");
    }

    #[test]
    fn test_counter_labels_accumulate_independently() {
        let counter = Counter::new("searches", "Total searches");
        counter.inc(1, &[("region", "a")]);
        counter.inc(2, &[("region", "b")]);
        counter.inc(3, &[("region", "a")]);
        counter.inc(4, &[]);

        assert_eq!(counter.get(&[("region", "a")]), 4);
        assert_eq!(counter.get(&[("region", "b")]), 2);
        assert_eq!(counter.get(&[("region", "c")]), 0);
        assert_eq!(counter.get(&[]), 10);

        let values = counter.values();
        assert_eq!(values["total"], 10);
        assert_eq!(values["region=a"], 4);
    }

    #[test]
    fn test_counter_concurrent_increments() {
        let counter = Arc::new(Counter::new("hits", ""));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    let shard = if i % 2 == 0 { "even" } else { "odd" };
                    for _ in 0..1000 {
                        counter.inc(1, &[("shard", shard)]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.get(&[]), 8000);
        assert_eq!(counter.get(&[("shard", "even")]), 4000);
        assert_eq!(counter.get(&[("shard", "odd")]), 4000);
    }

    #[test]
    fn test_gauge_set_inc_dec() {
        let gauge = Gauge::new("active", "Active searches");
        gauge.set(3.0, &[]);
        gauge.inc(2.0, &[]);
        gauge.dec(1.0, &[]);
        assert_eq!(gauge.get(&[]), 4.0);

        gauge.set(2.0, &[("breaker", "search")]);
        gauge.set(0.0, &[("breaker", "search")]);
        assert_eq!(gauge.get(&[("breaker", "search")]), 0.0);
        assert_eq!(gauge.get(&[]), 0.0);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let hist = Histogram::new("latency", "", &[1.0, 0.01, 0.1]);

        // 0.05 lands in the 0.1 and 1.0 buckets
        hist.observe(0.05);
        hist.observe(5.0);

        let snapshot = hist.snapshot();
        let counts: Vec<u64> = snapshot.buckets.iter().map(|b| b.count).collect();
        let bounds: Vec<f64> = snapshot.buckets.iter().map(|b| b.upper_bound).collect();
        assert_eq!(bounds, vec![0.01, 0.1, 1.0]);
        assert_eq!(counts, vec![0, 1, 1]);
        assert_eq!(snapshot.count, 2);
        assert!((snapshot.sum - 5.05).abs() < 1e-9);
        assert!((snapshot.avg - 2.525).abs() < 1e-9);
    }

    #[test]
    fn test_histogram_boundary_value_is_included() {
        let hist = Histogram::with_default_buckets("delay", "");
        hist.observe(1.0);
        let snapshot = hist.snapshot();
        for bucket in &snapshot.buckets {
            let expected = u64::from(bucket.upper_bound >= 1.0);
            assert_eq!(bucket.count, expected, "bucket {}", bucket.upper_bound);
        }
    }

    #[test]
    fn test_timer_observes_on_drop() {
        let hist = Histogram::with_default_buckets("op", "");
        {
            let _timer = hist.start_timer();
        }
        assert_eq!(hist.count(), 1);
    }

    #[test]
    fn test_sliding_window_stats() {
        let window = SlidingWindow::default();
        window.add(2.0);
        window.add(4.0);
        window.add(9.0);

        let stats = window.stats();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.sum, 15.0);
        assert_eq!(stats.avg, 5.0);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 9.0);
    }

    #[test]
    fn test_sliding_window_prunes_old_entries() {
        let window = SlidingWindow::new(Duration::from_millis(50));
        window.add(100.0);
        std::thread::sleep(Duration::from_millis(80));
        window.add(1.0);

        let stats = window.stats();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.max, 1.0);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(window.stats(), WindowStats::default());
    }

    #[test]
    fn test_sliding_window_values_since() {
        let window = SlidingWindow::default();
        window.add(1.0);
        let marker = Instant::now();
        window.add_at(2.0, marker);
        window.add(3.0);

        assert_eq!(window.values_since(marker), vec![2.0, 3.0]);
    }
}
