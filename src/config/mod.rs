// SPDX-License-Identifier: MIT OR Apache-2.0

//! Settings file for circuit breakers and retry executors
//!
//! # Environment Variables
//!
//! - `RESILIENCE_CONFIG` - Path to the settings file (default: `~/.resilience/config.yaml`)
//!
//! # Example
//!
//! ```no_run
//! use resilience_rs::config::ResilienceSettings;
//! use resilience_rs::ResilienceRegistry;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = ResilienceSettings::load_with_env()?;
//! let breaker = settings.breaker_config("search")?;
//! println!("search trips after {} failures", breaker.failure_threshold);
//!
//! let registry = ResilienceRegistry::from_settings(settings);
//! # Ok(())
//! # }
//! ```

mod settings;

pub use settings::{
    BreakerSettings, DefaultSettings, ResilienceSettings, RetryPreset, RetrySettings,
    ENV_RESILIENCE_CONFIG,
};
