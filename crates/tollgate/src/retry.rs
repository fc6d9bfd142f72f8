// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cmp::min;
use std::fmt::Display;
use std::time::Duration;

use tick::Clock;

/// A single attempt of a retried operation.
///
/// Indices are 0-based: the first attempt has index 0.
///
/// # Examples
///
/// ```
/// use tollgate::Attempt;
///
/// let attempt = Attempt::new(0, false);
/// assert!(attempt.is_first());
/// assert!(!attempt.is_last());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    index: u32,
    is_last: bool,
}

impl Default for Attempt {
    fn default() -> Self {
        Self::new(0, true)
    }
}

impl Attempt {
    /// Creates an attempt with the given index.
    #[must_use]
    pub fn new(index: u32, is_last: bool) -> Self {
        Self { index, is_last }
    }

    /// Returns `true` for the first attempt.
    #[must_use]
    pub fn is_first(self) -> bool {
        self.index == 0
    }

    /// Returns `true` if no further attempt follows this one.
    #[must_use]
    pub fn is_last(self) -> bool {
        self.is_last
    }

    /// Returns the 0-based attempt index.
    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }
}

impl Display for Attempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.index.fmt(f)
    }
}

/// Re-attempts a failing operation with exponentially growing delays.
///
/// The first retry waits `base_delay`; every following one waits `backoff_factor` times
/// longer than the previous, never more than `max_delay`. The operation runs at most
/// `max_attempts` times in total.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use tollgate::RetryPolicy;
///
/// let policy = RetryPolicy::new(4, Duration::from_secs(1), 2.0, Duration::from_secs(3));
///
/// let delays: Vec<_> = policy.delays().take(4).collect();
/// assert_eq!(delays, [1, 2, 3, 3].map(Duration::from_secs));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a retry policy.
    ///
    /// A `max_attempts` of zero is treated as one. Factors below one or not finite are treated
    /// as one, which yields a constant delay.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff_factor: if backoff_factor.is_finite() && backoff_factor >= 1.0 {
                backoff_factor
            } else {
                1.0
            },
            max_delay,
        }
    }

    /// Returns the maximum number of attempts, including the first one.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the infinite sequence of delays slept between attempts.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        Delays {
            next_secs: self.base_delay.as_secs_f64(),
            factor: self.backoff_factor,
            max_delay: self.max_delay,
        }
    }

    /// Runs `operation` until it succeeds or the attempts run out.
    ///
    /// Every failure is retried regardless of its cause. The error of the final attempt is
    /// returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns the last error of `operation` if every attempt failed.
    pub async fn execute<T, E, F, Fut>(&self, clock: &Clock, operation: F) -> Result<T, E>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with(clock, operation, |_, _, delay| Some(delay)).await
    }

    /// Like [`execute`][Self::execute], but `next_delay` decides after each failure whether to
    /// retry and for how long to wait.
    ///
    /// `next_delay` receives the error, the attempt that produced it and the backoff delay;
    /// returning `None` stops and propagates the error. It is not consulted after the last
    /// attempt.
    pub(crate) async fn execute_with<T, E, F, Fut, D>(&self, clock: &Clock, mut operation: F, mut next_delay: D) -> Result<T, E>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        D: FnMut(&E, Attempt, Duration) -> Option<Duration>,
    {
        let mut delays = self.delays();
        let mut index = 0;

        loop {
            let attempt = Attempt::new(index, index + 1 >= self.max_attempts);

            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if attempt.is_last() {
                return Err(error);
            }

            let backoff = delays.next().unwrap_or(self.max_delay);
            let Some(delay) = next_delay(&error, attempt, backoff) else {
                return Err(error);
            };

            clock.delay(delay).await;
            index += 1;
        }
    }
}

#[derive(Debug)]
struct Delays {
    next_secs: f64,
    factor: f64,
    max_delay: Duration,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        let delay = min(secs_to_duration_saturating(self.next_secs), self.max_delay);

        // Stop growing once capped so the value cannot overflow to infinity.
        if delay < self.max_delay {
            self.next_secs *= self.factor;
        }

        Some(delay)
    }
}

fn secs_to_duration_saturating(secs: f64) -> Duration {
    if secs <= 0.0 {
        return Duration::ZERO;
    }

    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
