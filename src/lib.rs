// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod config;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod runtime;

pub use config::ResilienceSettings;
pub use error::{ErrorKind, ResilienceError, Result};
pub use metrics::MetricsSink;
pub use registry::{Guard, GuardConfig, GuardHandles, RegistryStatus, ResilienceRegistry};
pub use runtime::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, ErrorMatcher, RetryExecutor, RetryPolicy,
};
