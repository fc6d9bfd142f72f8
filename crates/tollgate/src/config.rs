// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Tunables of a [`Gateway`][crate::Gateway], normally supplied once at startup.
///
/// The struct deserializes from any serde format with `snake_case` keys; missing keys take
/// their defaults. Durations are expressed in (fractional) seconds.
///
/// # Examples
///
/// ```
/// use tollgate::GatewayConfig;
///
/// let config: GatewayConfig = serde_json::from_str(r#"{ "rate_limit_calls": 10, "retry_max_attempts": 5 }"#)?;
///
/// assert_eq!(config.rate_limit_calls, 10);
/// assert_eq!(config.max_cache_entries, 1000);
/// config.validate()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// How long a cached result remains eligible for reuse.
    pub cache_ttl_seconds: f64,
    /// Number of cached results kept before the least recently used one is evicted.
    pub max_cache_entries: usize,
    /// Token bucket capacity.
    pub rate_limit_calls: u32,
    /// Period over which `rate_limit_calls` calls are allowed.
    pub rate_limit_period_seconds: f64,
    /// Consecutive failures that open the circuit.
    pub circuit_fail_threshold: u32,
    /// Cooldown before an open circuit admits a trial call.
    pub circuit_timeout_seconds: f64,
    /// Total attempts per invocation, including the first one.
    pub retry_max_attempts: u32,
    /// Delay before the first retry.
    pub retry_base_delay: f64,
    /// Multiplier applied to the delay after each retry.
    pub retry_backoff_factor: f64,
    /// Upper bound for any single retry delay.
    pub retry_max_delay: f64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 3600.0,
            max_cache_entries: 1000,
            rate_limit_calls: 50,
            rate_limit_period_seconds: 60.0,
            circuit_fail_threshold: 5,
            circuit_timeout_seconds: 60.0,
            retry_max_attempts: 3,
            retry_base_delay: 1.0,
            retry_backoff_factor: 2.0,
            retry_max_delay: 60.0,
        }
    }
}

impl GatewayConfig {
    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("max_cache_entries", self.max_cache_entries)?;
        non_zero("rate_limit_calls", self.rate_limit_calls)?;
        non_zero("circuit_fail_threshold", self.circuit_fail_threshold)?;
        non_zero("retry_max_attempts", self.retry_max_attempts)?;

        if seconds("rate_limit_period_seconds", self.rate_limit_period_seconds)?.is_zero() {
            return Err(ConfigError::caused_by("rate_limit_period_seconds", "must be greater than zero"));
        }

        seconds("cache_ttl_seconds", self.cache_ttl_seconds)?;
        seconds("circuit_timeout_seconds", self.circuit_timeout_seconds)?;
        seconds("retry_base_delay", self.retry_base_delay)?;
        seconds("retry_max_delay", self.retry_max_delay)?;

        if !self.retry_backoff_factor.is_finite() || self.retry_backoff_factor < 1.0 {
            return Err(ConfigError::caused_by(
                "retry_backoff_factor",
                format!("must be a finite number of at least 1, got {}", self.retry_backoff_factor),
            ));
        }

        Ok(())
    }

    pub(crate) fn cache_ttl(&self) -> Result<Duration, ConfigError> {
        seconds("cache_ttl_seconds", self.cache_ttl_seconds)
    }

    pub(crate) fn rate_limit_period(&self) -> Result<Duration, ConfigError> {
        seconds("rate_limit_period_seconds", self.rate_limit_period_seconds)
    }

    pub(crate) fn circuit_timeout(&self) -> Result<Duration, ConfigError> {
        seconds("circuit_timeout_seconds", self.circuit_timeout_seconds)
    }

    pub(crate) fn retry_base_delay(&self) -> Result<Duration, ConfigError> {
        seconds("retry_base_delay", self.retry_base_delay)
    }

    pub(crate) fn retry_max_delay(&self) -> Result<Duration, ConfigError> {
        seconds("retry_max_delay", self.retry_max_delay)
    }
}

fn non_zero<T: Default + PartialEq>(field: &'static str, value: T) -> Result<(), ConfigError> {
    if value == T::default() {
        return Err(ConfigError::caused_by(field, "must be greater than zero"));
    }

    Ok(())
}

fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| ConfigError::caused_by(field, format!("{value} is not a valid number of seconds: {e}")))
}
