// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use tick::Clock;

// Absorbs floating-point rounding so that waiting exactly `wait_time()` always yields a token.
const TOLERANCE: f64 = 1e-9;

/// Token bucket admission control.
///
/// The bucket holds up to `capacity` tokens and refills continuously at `capacity / period`
/// tokens per second, based solely on the time elapsed since the previous refill. Every
/// operation refills first and then reads or consumes tokens under the same lock, so
/// concurrent callers can never spend the same token twice.
///
/// The bucket starts full.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use tick::Clock;
/// use tollgate::RateLimiter;
///
/// let limiter = RateLimiter::new(2, Duration::from_secs(10), &Clock::new_frozen());
///
/// assert!(limiter.acquire(1));
/// assert!(limiter.acquire(1));
/// assert!(!limiter.acquire(1));
/// assert_eq!(limiter.wait_time(), Duration::from_secs(5));
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    capacity: u32,
    period: Duration,
    clock: Clock,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    acquired: u64,
}

/// Point-in-time view of a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[non_exhaustive]
pub struct RateLimiterStats {
    /// Tokens currently available, possibly fractional.
    pub tokens: f64,
    /// Maximum number of tokens.
    pub capacity: u32,
    /// Successful acquisitions since the limiter was created.
    pub acquired: u64,
    /// Time until at least one token is available, serialized in seconds.
    #[serde(serialize_with = "serialize_secs")]
    pub wait_time: Duration,
}

impl RateLimiter {
    /// Creates a full bucket that admits `capacity` calls per `period`.
    ///
    /// A zero `period` refills instantly; a zero `capacity` never admits anything.
    #[must_use]
    pub fn new(capacity: u32, period: Duration, clock: &Clock) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: f64::from(capacity),
                last_refill: clock.instant(),
                acquired: 0,
            }),
            capacity,
            period,
            clock: clock.clone(),
        }
    }

    /// Takes `n` tokens if that many are available.
    ///
    /// Returns `false` without consuming anything otherwise. Requests for more tokens than the
    /// capacity always fail.
    pub fn acquire(&self, n: u32) -> bool {
        if n > self.capacity {
            return false;
        }

        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);

        let wanted = f64::from(n);
        if bucket.tokens + TOLERANCE < wanted {
            return false;
        }

        bucket.tokens = (bucket.tokens - wanted).max(0.0);
        bucket.acquired += 1;
        true
    }

    /// Returns how long until at least one token is available; zero if one is available now.
    ///
    /// A limiter with zero capacity reports [`Duration::MAX`].
    #[must_use]
    pub fn wait_time(&self) -> Duration {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        self.wait_for(&bucket)
    }

    /// Returns the bucket capacity.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Returns the period over which `capacity` tokens are refilled.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Returns the current state of the bucket.
    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);

        RateLimiterStats {
            tokens: bucket.tokens,
            capacity: self.capacity,
            acquired: bucket.acquired,
            wait_time: self.wait_for(&bucket),
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = self.clock.instant();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let capacity = f64::from(self.capacity);

        bucket.tokens = if self.period.is_zero() {
            capacity
        } else {
            elapsed
                .as_secs_f64()
                .mul_add(capacity / self.period.as_secs_f64(), bucket.tokens)
                .min(capacity)
        };
        bucket.last_refill = now;
    }

    fn wait_for(&self, bucket: &Bucket) -> Duration {
        if bucket.tokens + TOLERANCE >= 1.0 {
            return Duration::ZERO;
        }

        if self.capacity == 0 {
            return Duration::MAX;
        }

        let secs = (1.0 - bucket.tokens) * self.period.as_secs_f64() / f64::from(self.capacity);
        ceil_to_nanos(secs)
    }
}

// Rounds up so that a caller sleeping for the returned duration never wakes up early.
fn ceil_to_nanos(secs: f64) -> Duration {
    // Below `u64::MAX`, roughly 584 years.
    const MAX_NANOS: f64 = 1.8e19;

    let nanos = (secs * 1e9).ceil();

    if nanos <= 0.0 {
        Duration::ZERO
    } else if nanos >= MAX_NANOS {
        Duration::MAX
    } else {
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "range checked above")]
        let nanos = nanos as u64;
        Duration::from_nanos(nanos)
    }
}

pub(crate) fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tick::ClockControl;

    use super::*;

    fn limiter(capacity: u32, period_secs: u64) -> (RateLimiter, ClockControl) {
        let control = ClockControl::new();
        let limiter = RateLimiter::new(capacity, Duration::from_secs(period_secs), &control.to_clock());
        (limiter, control)
    }

    #[test]
    fn burst_is_bounded_by_capacity() {
        let (limiter, control) = limiter(5, 10);

        let admitted = (0..7).filter(|_| limiter.acquire(1)).count();
        assert_eq!(admitted, 5);

        control.advance(Duration::from_secs(10));

        let admitted = (0..7).filter(|_| limiter.acquire(1)).count();
        assert_eq!(admitted, 5);
        assert_eq!(limiter.stats().acquired, 10);
    }

    #[test]
    fn refill_is_proportional_to_elapsed_time() {
        let (limiter, control) = limiter(10, 10);
        assert!(limiter.acquire(10));

        control.advance(Duration::from_secs(3));

        let stats = limiter.stats();
        assert!((stats.tokens - 3.0).abs() < 1e-6, "{}", stats.tokens);
        assert!(limiter.acquire(3));
        assert!(!limiter.acquire(1));
    }

    #[test]
    fn tokens_never_exceed_capacity() {
        let (limiter, control) = limiter(4, 1);
        control.advance(Duration::from_secs(3600));

        assert!((limiter.stats().tokens - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn failed_acquire_consumes_nothing() {
        let (limiter, _) = limiter(3, 60);
        assert!(limiter.acquire(2));

        assert!(!limiter.acquire(2));
        assert!(limiter.acquire(1));
    }

    #[test]
    fn acquire_more_than_capacity_fails() {
        let (limiter, _) = limiter(3, 60);

        assert!(!limiter.acquire(4));
        assert!((limiter.stats().tokens - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn wait_time_is_time_to_next_token() {
        let (limiter, control) = limiter(5, 10);
        assert_eq!(limiter.wait_time(), Duration::ZERO);

        for _ in 0..5 {
            assert!(limiter.acquire(1));
        }
        assert_eq!(limiter.wait_time(), Duration::from_secs(2));

        control.advance(Duration::from_millis(500));
        assert_eq!(limiter.wait_time(), Duration::from_millis(1500));
    }

    #[test]
    fn waiting_the_reported_time_yields_a_token() {
        let (limiter, control) = limiter(3, 7);
        for _ in 0..3 {
            assert!(limiter.acquire(1));
        }

        for _ in 0..20 {
            let wait = limiter.wait_time();
            assert!(wait > Duration::ZERO);
            control.advance(wait);
            assert!(limiter.acquire(1), "token expected after waiting {wait:?}");
        }
    }

    #[test]
    fn zero_capacity_never_admits() {
        let (limiter, _) = limiter(0, 10);

        assert!(!limiter.acquire(1));
        assert_eq!(limiter.wait_time(), Duration::MAX);
    }

    #[test]
    fn zero_period_refills_instantly() {
        let control = ClockControl::new();
        let limiter = RateLimiter::new(2, Duration::ZERO, &control.to_clock());

        for _ in 0..10 {
            assert!(limiter.acquire(2));
        }
        assert_eq!(limiter.wait_time(), Duration::ZERO);
    }

    #[test]
    fn concurrent_acquires_never_overspend() {
        let (limiter, _) = limiter(100, 3600);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || (0..50).filter(|_| limiter.acquire(1)).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(admitted, 100);
        assert!(limiter.stats().tokens >= 0.0);
    }

    #[test]
    fn stats_serialize_wait_time_in_seconds() {
        let (limiter, _) = limiter(1, 4);
        assert!(limiter.acquire(1));

        let json = serde_json::to_value(limiter.stats()).unwrap();

        assert_eq!(json["capacity"], 1);
        assert_eq!(json["acquired"], 1);
        assert!((json["wait_time"].as_f64().unwrap() - 4.0).abs() < 1e-6);
        assert_eq!(limiter.capacity(), 1);
        assert_eq!(limiter.period(), Duration::from_secs(4));
    }

    #[test]
    fn ceil_to_nanos_rounds_up() {
        assert_eq!(ceil_to_nanos(0.0), Duration::ZERO);
        assert_eq!(ceil_to_nanos(-1.0), Duration::ZERO);
        assert_eq!(ceil_to_nanos(1.5e-9), Duration::from_nanos(2));
        assert_eq!(ceil_to_nanos(f64::INFINITY), Duration::MAX);
    }
}
