// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fault-tolerance runtime: circuit breakers and retry executors.
//!
//! The two compose by nesting; the breaker guards a whole retry cycle:
//!
//! ```ignore
//! let result = breaker.call(|| executor.run(|| fetch_page())).await;
//! ```

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    BreakerStatus, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
pub use retry::{
    Classification, ErrorMatcher, RetryExecutor, RetryPolicy, RetryStats, RetryStatus,
    MIN_JITTERED_DELAY,
};
