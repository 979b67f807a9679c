// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::error::{ErrorKind, ResilienceError, Result};
use crate::runtime::{CircuitBreakerConfig, ErrorMatcher, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable overriding the settings file location.
pub const ENV_RESILIENCE_CONFIG: &str = "RESILIENCE_CONFIG";

/// Resilience settings file.
///
/// Per-name entries override `defaults`, which override the built-in
/// defaults of [`CircuitBreakerConfig`] and [`RetryPolicy`]. Durations are
/// given in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    /// Settings shared by every named component.
    pub defaults: DefaultSettings,

    /// Circuit breaker settings by breaker name
    pub breakers: HashMap<String, BreakerSettings>,

    /// Retry settings by executor name
    pub retries: HashMap<String, RetrySettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultSettings {
    pub breaker: BreakerSettings,
    pub retry: RetrySettings,
}

/// Circuit breaker fields; unset fields fall through to the next layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_timeout: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u64>,

    /// Per-call deadline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub half_open_max_calls: Option<usize>,
}

/// Named retry policy presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPreset {
    Conservative,
    Standard,
    Aggressive,
    Network,
}

impl RetryPreset {
    #[must_use]
    pub fn policy(self) -> RetryPolicy {
        match self {
            RetryPreset::Conservative => RetryPolicy::conservative(),
            RetryPreset::Standard => RetryPolicy::standard(),
            RetryPreset::Aggressive => RetryPolicy::aggressive(),
            RetryPreset::Network => RetryPolicy::network(),
        }
    }
}

/// Retry fields; unset fields fall through to the next layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Policy the remaining fields are applied on top of
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<RetryPreset>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_delay: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_enabled: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_range: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_timeout: Option<f64>,

    /// Error kinds that are retried
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_on: Option<Vec<ErrorKind>>,

    /// Error kinds that stop retrying immediately
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_on: Option<Vec<ErrorKind>>,
}

impl BreakerSettings {
    /// Fields set in `other` win over fields set in `self`.
    #[must_use]
    pub fn overlay(&self, other: &BreakerSettings) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: other.failure_threshold.or(self.failure_threshold),
            recovery_timeout: other.recovery_timeout.or(self.recovery_timeout),
            success_threshold: other.success_threshold.or(self.success_threshold),
            timeout: other.timeout.or(self.timeout),
            half_open_max_calls: other.half_open_max_calls.or(self.half_open_max_calls),
        }
    }

    /// Build a validated breaker configuration.
    ///
    /// # Errors
    ///
    /// Returns `ResilienceError::Config` for negative or non-finite durations
    /// and for values [`CircuitBreakerConfig::validate`] rejects.
    pub fn to_config(&self) -> Result<CircuitBreakerConfig> {
        let mut config = CircuitBreakerConfig::default();
        if let Some(threshold) = self.failure_threshold {
            config = config.with_failure_threshold(threshold);
        }
        if let Some(secs) = self.recovery_timeout {
            config = config.with_recovery_timeout(seconds("recovery_timeout", secs)?);
        }
        if let Some(threshold) = self.success_threshold {
            config = config.with_success_threshold(threshold);
        }
        if let Some(secs) = self.timeout {
            config = config.with_timeout(seconds("timeout", secs)?);
        }
        if let Some(max) = self.half_open_max_calls {
            config = config.with_half_open_max_calls(max);
        }
        config.validate()?;
        Ok(config)
    }
}

impl RetrySettings {
    /// Fields set in `other` win over fields set in `self`.
    #[must_use]
    pub fn overlay(&self, other: &RetrySettings) -> RetrySettings {
        RetrySettings {
            preset: other.preset.or(self.preset),
            max_attempts: other.max_attempts.or(self.max_attempts),
            base_delay: other.base_delay.or(self.base_delay),
            max_delay: other.max_delay.or(self.max_delay),
            backoff_multiplier: other.backoff_multiplier.or(self.backoff_multiplier),
            jitter_enabled: other.jitter_enabled.or(self.jitter_enabled),
            jitter_range: other.jitter_range.or(self.jitter_range),
            total_timeout: other.total_timeout.or(self.total_timeout),
            retry_on: other.retry_on.clone().or_else(|| self.retry_on.clone()),
            stop_on: other.stop_on.clone().or_else(|| self.stop_on.clone()),
        }
    }

    /// Build a validated retry policy.
    ///
    /// # Errors
    ///
    /// Returns `ResilienceError::Config` for negative or non-finite durations
    /// and for values [`RetryPolicy::validate`] rejects.
    pub fn to_policy(&self) -> Result<RetryPolicy> {
        let mut policy = self.preset.map_or_else(RetryPolicy::default, RetryPreset::policy);
        if let Some(max) = self.max_attempts {
            policy = policy.with_max_attempts(max);
        }
        if let Some(secs) = self.base_delay {
            policy = policy.with_base_delay(seconds("base_delay", secs)?);
        }
        if let Some(secs) = self.max_delay {
            policy = policy.with_max_delay(seconds("max_delay", secs)?);
        }
        if let Some(multiplier) = self.backoff_multiplier {
            policy = policy.with_backoff_multiplier(multiplier);
        }
        if let Some(enabled) = self.jitter_enabled {
            policy = policy.with_jitter(enabled);
        }
        if let Some(range) = self.jitter_range {
            policy = policy.with_jitter_range(range);
        }
        if let Some(secs) = self.total_timeout {
            policy = policy.with_total_timeout(seconds("total_timeout", secs)?);
        }
        if let Some(kinds) = &self.retry_on {
            policy = policy.with_retryable(ErrorMatcher::new(kinds.iter().copied()));
        }
        if let Some(kinds) = &self.stop_on {
            policy = policy.with_fatal(ErrorMatcher::new(kinds.iter().copied()));
        }
        policy.validate()?;
        Ok(policy)
    }
}

fn seconds(field: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        ResilienceError::Config(format!(
            "{field} must be a finite, non-negative number of seconds (got {secs})"
        ))
    })
}

impl ResilienceSettings {
    /// Load settings from the default location (~/.resilience/config.yaml)
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined, the file
    /// cannot be read, or its contents are invalid.
    pub fn load_default() -> Result<Self> {
        Self::load_from_path(Self::default_path()?)
    }

    /// Load settings from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or its contents are invalid.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ResilienceError::Config(format!(
                "Failed to read settings file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        debug!(path = %path.as_ref().display(), "Loaded resilience settings");
        Self::from_yaml(&content)
    }

    /// Load settings from [`Self::config_path`].
    ///
    /// A missing file at the default location yields the built-in defaults;
    /// a missing file named by `RESILIENCE_CONFIG` is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or its contents are invalid.
    pub fn load_with_env() -> Result<Self> {
        let explicit = std::env::var_os(ENV_RESILIENCE_CONFIG).is_some();
        let path = Self::config_path()?;
        if !explicit && !path.exists() {
            debug!(path = %path.display(), "No resilience settings file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from_path(path)
    }

    /// Parse and validate settings from a YAML string
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed or any entry is invalid.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: Self = serde_yaml::from_str(yaml).map_err(|e| {
            ResilienceError::Config(format!("Failed to parse settings YAML: {}", e))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Get the default settings path (~/.resilience/config.yaml)
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| {
            ResilienceError::Config("Could not determine home directory".to_string())
        })?;

        Ok(home.join(".resilience").join("config.yaml"))
    }

    /// Get the settings path, respecting the RESILIENCE_CONFIG environment variable
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined when
    /// RESILIENCE_CONFIG is not set
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(env_path) = std::env::var(ENV_RESILIENCE_CONFIG) {
            Ok(PathBuf::from(env_path))
        } else {
            Self::default_path()
        }
    }

    /// Resolve every entry, reporting the first invalid one.
    ///
    /// # Errors
    ///
    /// Returns `ResilienceError::Config` naming the offending entry.
    pub fn validate(&self) -> Result<()> {
        let in_entry = |what: &str, name: &str, err: ResilienceError| {
            ResilienceError::Config(format!("{what} '{name}': {err}"))
        };

        self.breaker_config("defaults")
            .map_err(|e| in_entry("breaker", "defaults", e))?;
        self.retry_policy("defaults")
            .map_err(|e| in_entry("retry", "defaults", e))?;
        for name in self.breakers.keys() {
            self.breaker_config(name)
                .map_err(|e| in_entry("breaker", name, e))?;
        }
        for name in self.retries.keys() {
            self.retry_policy(name)
                .map_err(|e| in_entry("retry", name, e))?;
        }
        Ok(())
    }

    /// Breaker configuration for `name`, layered over the defaults.
    ///
    /// # Errors
    ///
    /// Returns `ResilienceError::Config` if the resolved values are invalid.
    pub fn breaker_config(&self, name: &str) -> Result<CircuitBreakerConfig> {
        match self.breakers.get(name) {
            Some(entry) => self.defaults.breaker.overlay(entry).to_config(),
            None => self.defaults.breaker.to_config(),
        }
    }

    /// Retry policy for `name`, layered over the defaults.
    ///
    /// # Errors
    ///
    /// Returns `ResilienceError::Config` if the resolved values are invalid.
    pub fn retry_policy(&self, name: &str) -> Result<RetryPolicy> {
        match self.retries.get(name) {
            Some(entry) => self.defaults.retry.overlay(entry).to_policy(),
            None => self.defaults.retry.to_policy(),
        }
    }

    /// Whether the file names a breaker or executor called `name`.
    #[must_use]
    pub fn has_entry(&self, name: &str) -> bool {
        self.breakers.contains_key(name) || self.retries.contains_key(name)
    }
}
