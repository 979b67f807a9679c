// SPDX-License-Identifier: MIT OR Apache-2.0

//! Metric primitives and the named metrics sink.
//!
//! This module provides the counters, gauges, histograms and sliding windows
//! that the circuit breakers and retry executors report into.
//!
//! # Example
//!
//! ```rust
//! use resilience_rs::metrics::{MetricsSink, BREAKER_CALLS};
//!
//! let sink = MetricsSink::new();
//! let calls = sink.counter(BREAKER_CALLS).expect("core metric");
//!
//! calls.inc(1, &[("breaker", "search"), ("outcome", "success")]);
//! calls.inc(1, &[("breaker", "search"), ("outcome", "failure")]);
//!
//! assert_eq!(calls.get(&[]), 2);
//! assert_eq!(calls.get(&[("outcome", "success"), ("breaker", "search")]), 1);
//! ```

mod primitives;
mod sink;

pub use primitives::{
    labels_key, BucketCount, Counter, Gauge, Histogram, HistogramSnapshot, SlidingWindow, Timer,
    WindowStats, DEFAULT_BUCKETS, DEFAULT_WINDOW,
};
pub use sink::{
    CounterSnapshot, GaugeSnapshot, MetricsSink, MetricsSnapshot, BREAKER_CALLS,
    BREAKER_CALL_DURATION, BREAKER_LATENCY, BREAKER_OPENS, BREAKER_STATE, RETRY_ATTEMPTS,
    RETRY_DELAY, RETRY_EXHAUSTED,
};
