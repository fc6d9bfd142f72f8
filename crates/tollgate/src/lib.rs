// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(
    not(all(feature = "logs", feature = "metrics")),
    expect(rustdoc::broken_intra_doc_links, reason = "telemetry options only exist with their features")
)]

//! Caching, rate limiting, circuit breaking and retries around a single metered remote call.
//!
//! Remote operations such as scoring APIs or model inference endpoints are typically slow,
//! billed per call, quota-limited and occasionally unavailable. A [`Gateway`] wraps such an
//! operation so that callers get:
//!
//! - **Caching**: results are keyed by a [`Fingerprint`] of the request, a stable hash that
//!   ignores key order, and are reused until their time-to-live elapses. See [`Cache`].
//! - **Rate limiting**: a token bucket bounds the number of calls per period; callers wait for a
//!   token instead of overrunning the quota. See [`RateLimiter`].
//! - **Circuit breaking**: after consecutive failures the circuit opens and calls fail fast until
//!   a cooldown passes, then a single trial call decides whether to close it again. See
//!   [`CircuitBreaker`].
//! - **Retries**: failed attempts are repeated with exponential backoff. See [`RetryPolicy`].
//!
//! All timing goes through a [`Clock`][tick::Clock], so the whole stack can be driven
//! deterministically in tests with `tick::ClockControl`.
//!
//! # Quick Start
//!
//! ```rust
//! use std::time::Duration;
//!
//! use layered::Execute;
//! use tick::Clock;
//! use tollgate::{Gateway, GatewayConfig, GatewayOptions, InvokeOptions};
//!
//! # async fn score(startup: String) -> Result<f64, std::io::Error> { Ok(0.5) }
//! # async fn example(clock: Clock) -> Result<(), Box<dyn std::error::Error>> {
//! let config: GatewayConfig = serde_json::from_str(r#"{ "rate_limit_calls": 10, "retry_max_attempts": 5 }"#)?;
//! let options = GatewayOptions::<std::io::Error>::new(&clock).name("scoring");
//! let gateway = Gateway::new(&config, options, Execute::new(score))?;
//!
//! let cached = gateway.invoke("acme".to_string()).await?;
//! let fresh = gateway
//!     .invoke_with("acme".to_string(), InvokeOptions::new().bypass_cache().deadline(Duration::from_secs(30)))
//!     .await?;
//! # let _ = (cached, fresh);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! [`GatewayConfig`] holds the numeric settings and deserializes with `serde`, missing fields
//! taking their defaults. Everything that cannot be plain data, such as the clock, the telemetry
//! sinks and the error classifier, is passed through [`GatewayOptions`].
//!
//! # Errors
//!
//! [`Gateway::invoke`] fails with [`InvokeError`], which distinguishes rejections by the gateway
//! itself from failures of the wrapped operation. All error types implement
//! [`Recovery`][recoverable::Recovery].
//!
//! # Telemetry
//!
//! With the `logs` feature, [`GatewayOptions::use_logs`] emits `tracing` events for every
//! [`Event`]. With the `metrics` feature, [`GatewayOptions::use_metrics`] reports them through an
//! OpenTelemetry counter named `tollgate.event`. See the [`telemetry`] module for attribute names.
//!
//! # Components
//!
//! The components are usable on their own:
//!
//! ```rust
//! use std::time::Duration;
//!
//! use tick::Clock;
//! use tollgate::{Cache, RateLimiter};
//!
//! let clock = Clock::new_frozen();
//! let cache = Cache::new(100, Duration::from_secs(60), &clock);
//! cache.put("acme", 0.82);
//! assert_eq!(cache.get(&"acme"), Some(0.82));
//!
//! let limiter = RateLimiter::new(5, Duration::from_secs(1), &clock);
//! assert!(limiter.acquire(5));
//! assert!(!limiter.acquire(1));
//! ```

mod breaker;
mod cache;
mod config;
mod error;
mod fingerprint;
mod gateway;
mod options;
mod rate_limit;
mod retry;
pub mod telemetry;
#[cfg(test)]
mod testing;

pub use breaker::{CircuitBreaker, CircuitPhase, CircuitStats};
pub use cache::{Cache, CacheStats};
pub use config::GatewayConfig;
pub use error::{CircuitOpenError, ConfigError, DeadlineExceeded, InvokeError, RateLimitExceeded};
pub use fingerprint::{Fingerprint, FingerprintError};
pub use gateway::{Gateway, GatewayStats};
pub use options::{GatewayOptions, InvokeOptions};
pub use rate_limit::{RateLimiter, RateLimiterStats};
pub use retry::{Attempt, RetryPolicy};
pub use telemetry::Event;
