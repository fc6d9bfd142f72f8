// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use recoverable::{Recovery, RecoveryInfo};

use crate::FingerprintError;

/// A token could not be acquired even after waiting for the bucket to refill.
///
/// This only happens when concurrent callers race for the same tokens. The `retry_after`
/// hint is the time until the bucket is expected to hold a token again.
#[ohno::error]
#[derive(Clone)]
#[display("rate limit exceeded, retry after {retry_after:?}")]
pub struct RateLimitExceeded {
    retry_after: Duration,
}

impl RateLimitExceeded {
    /// Returns the time until a token is expected to become available.
    #[must_use]
    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }
}

impl Recovery for RateLimitExceeded {
    fn recovery(&self) -> RecoveryInfo {
        RecoveryInfo::retry().delay(self.retry_after)
    }
}

/// The circuit breaker refused the call; the wrapped operation was not invoked.
#[ohno::error]
#[derive(Clone)]
#[display("circuit is open, retry after {retry_after:?}")]
pub struct CircuitOpenError {
    retry_after: Duration,
}

impl CircuitOpenError {
    /// Returns the remaining cooldown before a trial call is admitted.
    ///
    /// The value is zero when the cooldown already elapsed and another caller's trial
    /// call is in flight.
    #[must_use]
    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }
}

impl Recovery for CircuitOpenError {
    fn recovery(&self) -> RecoveryInfo {
        RecoveryInfo::unavailable().delay(self.retry_after)
    }
}

/// The caller's deadline would pass before the next attempt could start.
#[ohno::error]
#[derive(Clone)]
#[display("deadline of {deadline:?} exceeded")]
pub struct DeadlineExceeded {
    deadline: Duration,
}

impl DeadlineExceeded {
    /// Returns the deadline that was set for the invocation, relative to its start.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

/// A gateway configuration value is out of range.
#[ohno::error]
#[derive(Clone)]
#[display("invalid gateway configuration for '{field}'")]
pub struct ConfigError {
    field: String,
}

impl ConfigError {
    /// Returns the name of the offending configuration key.
    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }
}

/// Error returned by [`Gateway::invoke`][crate::Gateway::invoke].
///
/// Every variant except [`Call`][InvokeError::Call] is produced by the gateway itself; `Call`
/// carries the failure of the wrapped operation unchanged.
///
/// The [`Recovery`] implementation decides whether the gateway retries the failure:
///
/// | variant | recovery |
/// |---|---|
/// | `Call` | retry (configurable through [`GatewayOptions::recovery_with`][crate::GatewayOptions::recovery_with]) |
/// | `RateLimited` | retry after the limiter's hint |
/// | `CircuitOpen` | unavailable |
/// | `DeadlineExceeded`, `Fingerprint` | never |
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum InvokeError<E> {
    /// The rate limiter could not admit the call.
    RateLimited(RateLimitExceeded),
    /// The circuit breaker rejected the call.
    CircuitOpen(CircuitOpenError),
    /// The invocation's deadline passed.
    DeadlineExceeded(DeadlineExceeded),
    /// The request could not be fingerprinted.
    Fingerprint(FingerprintError),
    /// The wrapped operation failed.
    Call(E),
}

impl<E> InvokeError<E> {
    /// Returns `true` if the wrapped operation itself failed.
    #[must_use]
    pub fn is_call(&self) -> bool {
        matches!(self, Self::Call(_))
    }

    /// Returns `true` if the circuit breaker rejected the call.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }

    /// Returns `true` if the rate limiter could not admit the call.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    /// Returns `true` if the invocation ran out of time.
    #[must_use]
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded(_))
    }

    /// Returns the wrapped operation's error, if that is what failed.
    #[must_use]
    pub fn into_call(self) -> Option<E> {
        match self {
            Self::Call(error) => Some(error),
            _ => None,
        }
    }

    /// Returns a reference to the wrapped operation's error, if that is what failed.
    #[must_use]
    pub fn as_call(&self) -> Option<&E> {
        match self {
            Self::Call(error) => Some(error),
            _ => None,
        }
    }
}

impl<E: Display> Display for InvokeError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited(error) => Display::fmt(error, f),
            Self::CircuitOpen(error) => Display::fmt(error, f),
            Self::DeadlineExceeded(error) => Display::fmt(error, f),
            Self::Fingerprint(error) => Display::fmt(error, f),
            Self::Call(error) => write!(f, "call failed: {error}"),
        }
    }
}

impl<E: Error + 'static> Error for InvokeError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::RateLimited(error) => Some(error),
            Self::CircuitOpen(error) => Some(error),
            Self::DeadlineExceeded(error) => Some(error),
            Self::Fingerprint(error) => Some(error),
            Self::Call(error) => Some(error),
        }
    }
}

impl<E> Recovery for InvokeError<E> {
    fn recovery(&self) -> RecoveryInfo {
        match self {
            Self::RateLimited(error) => error.recovery(),
            Self::CircuitOpen(error) => error.recovery(),
            Self::DeadlineExceeded(_) | Self::Fingerprint(_) => RecoveryInfo::never(),
            Self::Call(_) => RecoveryInfo::retry(),
        }
    }
}

impl<E> From<RateLimitExceeded> for InvokeError<E> {
    fn from(error: RateLimitExceeded) -> Self {
        Self::RateLimited(error)
    }
}

impl<E> From<CircuitOpenError> for InvokeError<E> {
    fn from(error: CircuitOpenError) -> Self {
        Self::CircuitOpen(error)
    }
}

impl<E> From<DeadlineExceeded> for InvokeError<E> {
    fn from(error: DeadlineExceeded) -> Self {
        Self::DeadlineExceeded(error)
    }
}

impl<E> From<FingerprintError> for InvokeError<E> {
    fn from(error: FingerprintError) -> Self {
        Self::Fingerprint(error)
    }
}
