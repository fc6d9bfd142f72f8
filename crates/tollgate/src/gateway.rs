// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{self, Debug, Formatter};
use std::time::{Duration, Instant};

use layered::Service;
use recoverable::{Recovery, RecoveryKind};
use serde::Serialize;

use crate::telemetry::{Event, Telemetry, log_event};
use crate::{
    Attempt, Cache, CacheStats, CircuitBreaker, CircuitStats, ConfigError, DeadlineExceeded, Fingerprint, GatewayConfig, GatewayOptions,
    InvokeError, InvokeOptions, RateLimitExceeded, RateLimiter, RateLimiterStats, RetryPolicy,
};

/// Reliability front door for a single unreliable, rate-limited remote operation.
///
/// A gateway owns one [`Cache`], one [`RateLimiter`] and one [`CircuitBreaker`] and wraps the
/// operation, any [`layered::Service`], so that each invocation:
///
/// 1. fingerprints the request and returns a cached result if a fresh one exists;
/// 2. waits for the rate limiter and takes a token;
/// 3. calls the operation through the circuit breaker;
/// 4. caches a successful result.
///
/// Steps 1 to 4 form one attempt, and attempts are repeated by the gateway's [`RetryPolicy`].
/// Whether a failure is retried follows its [`Recovery`] classification, see [`InvokeError`].
///
/// Construct the gateway once and share it; it is `Send + Sync` when the operation is.
///
/// # Examples
///
/// ```
/// use layered::Execute;
/// use tick::Clock;
/// use tollgate::{Gateway, GatewayConfig, GatewayOptions};
///
/// # futures::executor::block_on(async {
/// let scorer = Execute::new(|startup: String| async move { Ok::<_, std::io::Error>(startup.len()) });
/// let options = GatewayOptions::<std::io::Error>::new(Clock::new_frozen());
/// let gateway = Gateway::new(&GatewayConfig::default(), options, scorer)?;
///
/// assert_eq!(gateway.invoke("acme".to_string()).await?, 4);
/// assert_eq!(gateway.invoke("acme".to_string()).await?, 4);
/// assert_eq!(gateway.stats().cache.hits, 1);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// # }).unwrap();
/// ```
pub struct Gateway<S, V, E> {
    service: S,
    cache: Cache<Fingerprint, V>,
    rate_limiter: RateLimiter,
    circuit_breaker: CircuitBreaker,
    retry_policy: RetryPolicy,
    options: GatewayOptions<E>,
    telemetry: Telemetry,
}

/// Aggregated view of a [`Gateway`]'s components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[non_exhaustive]
pub struct GatewayStats {
    /// Result cache counters.
    pub cache: CacheStats,
    /// Token bucket state.
    pub rate_limiter: RateLimiterStats,
    /// Circuit breaker state.
    pub circuit_breaker: CircuitStats,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    fn is_passed_by(self, ready_at: Option<Instant>) -> bool {
        ready_at.is_none_or(|ready_at| ready_at > self.at)
    }
}

impl<S, V, E> Gateway<S, V, E> {
    /// Creates a gateway around `service`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` does not pass [`GatewayConfig::validate`].
    pub fn new(config: &GatewayConfig, options: GatewayOptions<E>, service: S) -> Result<Self, ConfigError> {
        config.validate()?;

        let clock = options.clock().clone();
        let telemetry = options.create_telemetry();

        let cache = Cache::new(config.max_cache_entries, config.cache_ttl()?, &clock);
        let rate_limiter = RateLimiter::new(config.rate_limit_calls, config.rate_limit_period()?, &clock);
        let circuit_breaker =
            CircuitBreaker::new(config.circuit_fail_threshold, config.circuit_timeout()?, &clock).with_telemetry(telemetry.clone());
        let retry_policy = RetryPolicy::new(
            config.retry_max_attempts,
            config.retry_base_delay()?,
            config.retry_backoff_factor,
            config.retry_max_delay()?,
        );

        Ok(Self {
            service,
            cache,
            rate_limiter,
            circuit_breaker,
            retry_policy,
            options,
            telemetry,
        })
    }

    /// Returns the gateway name used in telemetry.
    #[must_use]
    pub fn name(&self) -> &str {
        self.options.gateway_name()
    }

    /// Returns the result cache.
    #[must_use]
    pub fn cache(&self) -> &Cache<Fingerprint, V> {
        &self.cache
    }

    /// Returns the rate limiter.
    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Returns the circuit breaker.
    #[must_use]
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    /// Returns the retry policy applied to every invocation.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Returns the wrapped operation.
    #[must_use]
    pub fn inner(&self) -> &S {
        &self.service
    }

    /// Returns the current state of all components.
    #[must_use]
    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            cache: self.cache.stats(),
            rate_limiter: self.rate_limiter.stats(),
            circuit_breaker: self.circuit_breaker.stats(),
        }
    }

    /// Clears the cache and closes the circuit.
    ///
    /// The rate limiter is left alone; its state derives from elapsed time.
    pub fn reset(&self) {
        self.cache.clear();
        self.circuit_breaker.reset();
    }

    /// Invokes the operation with default [`InvokeOptions`].
    ///
    /// # Errors
    ///
    /// Returns the failure of the last attempt once retrying stops, see [`InvokeError`].
    pub async fn invoke<R>(&self, request: R) -> Result<V, InvokeError<E>>
    where
        S: Service<R, Out = Result<V, E>>,
        R: Serialize + Clone,
        V: Clone,
    {
        self.invoke_with(request, InvokeOptions::default()).await
    }

    /// Invokes the operation with explicit per-call options.
    ///
    /// # Errors
    ///
    /// Returns the failure of the last attempt once retrying stops, see [`InvokeError`].
    pub async fn invoke_with<R>(&self, request: R, options: InvokeOptions) -> Result<V, InvokeError<E>>
    where
        S: Service<R, Out = Result<V, E>>,
        R: Serialize + Clone,
        V: Clone,
    {
        let key = Fingerprint::of(&request)?;
        let clock = self.options.clock();
        let use_cache = options.uses_cache();
        let deadline = options
            .get_deadline()
            .and_then(|budget| clock.instant().checked_add(budget).map(|at| Deadline { at, budget }));

        self.retry_policy
            .execute_with(
                clock,
                |_| self.attempt(&request, key, use_cache, deadline),
                |error, attempt, backoff| self.next_delay(error, attempt, backoff, deadline),
            )
            .await
    }

    async fn attempt<R>(&self, request: &R, key: Fingerprint, use_cache: bool, deadline: Option<Deadline>) -> Result<V, InvokeError<E>>
    where
        S: Service<R, Out = Result<V, E>>,
        R: Clone,
        V: Clone,
    {
        if use_cache {
            if let Some(value) = self.cache.get(&key) {
                self.telemetry.report(Event::CacheHit);
                log_event!(self.telemetry, tracing::Level::DEBUG, "cache_hit", request.fingerprint = %key);
                return Ok(value);
            }

            self.telemetry.report(Event::CacheMiss);
            log_event!(self.telemetry, tracing::Level::DEBUG, "cache_miss", request.fingerprint = %key);
        }

        self.admit(deadline).await?;

        let value = self
            .circuit_breaker
            .call(|| self.service.execute(request.clone()))
            .await?
            .map_err(InvokeError::Call)?;

        if use_cache {
            self.cache.put(key, value.clone());
        }

        Ok(value)
    }

    async fn admit(&self, deadline: Option<Deadline>) -> Result<(), InvokeError<E>> {
        let clock = self.options.clock();
        let wait = self.rate_limiter.wait_time();

        if !wait.is_zero() {
            if let Some(deadline) = deadline {
                if deadline.is_passed_by(clock.instant().checked_add(wait)) {
                    self.telemetry.report(Event::DeadlineExceeded);
                    log_event!(
                        self.telemetry,
                        tracing::Level::WARN,
                        "deadline_exceeded",
                        rate_limit.wait = wait.as_secs_f32()
                    );
                    return Err(DeadlineExceeded::new(deadline.budget).into());
                }
            }

            self.telemetry.report(Event::RateLimitWait);
            log_event!(
                self.telemetry,
                tracing::Level::INFO,
                "rate_limit_wait",
                rate_limit.wait = wait.as_secs_f32()
            );
            clock.delay(wait).await;
        }

        if self.rate_limiter.acquire(1) {
            return Ok(());
        }

        let retry_after = self.rate_limiter.wait_time();
        self.telemetry.report(Event::RateLimitExceeded);
        log_event!(
            self.telemetry,
            tracing::Level::WARN,
            "rate_limit_exceeded",
            rate_limit.retry_after = retry_after.as_secs_f32()
        );

        Err(RateLimitExceeded::new(retry_after).into())
    }

    #[cfg_attr(not(any(feature = "logs", test)), expect(unused_variables, reason = "attempt is only logged"))]
    fn next_delay(&self, error: &InvokeError<E>, attempt: Attempt, backoff: Duration, deadline: Option<Deadline>) -> Option<Duration> {
        let recovery = match error {
            InvokeError::Call(call_error) => self.options.classify(call_error),
            other => other.recovery(),
        };

        let retry = match recovery.kind() {
            RecoveryKind::Retry => true,
            RecoveryKind::Unavailable => error.is_circuit_open() && self.options.retries_when_circuit_open(),
            _ => false,
        };

        if !retry {
            return None;
        }

        let delay = recovery.get_delay().map_or(backoff, |hint| hint.max(backoff));

        if let Some(deadline) = deadline {
            if deadline.is_passed_by(self.options.clock().instant().checked_add(delay)) {
                self.telemetry.report(Event::DeadlineExceeded);
                log_event!(
                    self.telemetry,
                    tracing::Level::WARN,
                    "deadline_exceeded",
                    attempt.index = attempt.index(),
                    retry.delay = delay.as_secs_f32()
                );
                return None;
            }
        }

        self.telemetry.report(Event::Retry);
        log_event!(
            self.telemetry,
            tracing::Level::WARN,
            "retry",
            attempt.index = attempt.index(),
            retry.delay = delay.as_secs_f32()
        );

        Some(delay)
    }
}

impl<R, S, V, E> Service<R> for Gateway<S, V, E>
where
    S: Service<R, Out = Result<V, E>>,
    R: Serialize + Clone + Send + Sync,
    V: Clone + Send + Sync,
    E: Send + Sync,
{
    type Out = Result<V, InvokeError<E>>;

    fn execute(&self, input: R) -> impl Future<Output = Self::Out> + Send {
        self.invoke(input)
    }
}

impl<S, V, E> Debug for Gateway<S, V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("name", &self.name())
            .field("cache", &self.cache.stats())
            .field("rate_limiter", &self.rate_limiter)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}
