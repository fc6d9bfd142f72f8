// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use tick::Clock;

use crate::CircuitOpenError;
use crate::telemetry::{Event, Telemetry, log_event};

/// The phase of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    /// Calls pass through.
    Closed,
    /// Calls are rejected until the cooldown elapses.
    Open,
    /// A single trial call decides whether the circuit closes or opens again.
    HalfOpen,
}

/// Point-in-time view of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct CircuitStats {
    /// Current phase.
    pub phase: CircuitPhase,
    /// Failures recorded since the circuit last closed after a trial call, or was reset.
    pub consecutive_failures: u32,
    /// Consecutive failures that open the circuit.
    pub fail_threshold: u32,
    /// Wall-clock time of the most recent failure, if any.
    pub last_failure_at: Option<SystemTime>,
}

/// Three-state failure detector isolating a persistently failing operation.
///
/// The circuit starts closed and lets calls through. Once `fail_threshold` consecutive calls
/// fail it opens and rejects calls with [`CircuitOpenError`] without invoking them. After
/// `timeout` has passed since the last failure, the next call is admitted as a trial: success
/// closes the circuit, failure opens it again and restarts the cooldown.
///
/// Only one trial call is in flight at a time; concurrent callers are rejected while it runs.
/// Dropping a trial call's future before it completes frees the trial slot for the next caller.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use tick::Clock;
/// use tollgate::{CircuitBreaker, CircuitPhase};
///
/// # futures::executor::block_on(async {
/// let breaker = CircuitBreaker::new(2, Duration::from_secs(30), &Clock::new_frozen());
///
/// for _ in 0..2 {
///     let outcome = breaker.call(|| async { Err::<(), _>("unreachable host") }).await;
///     assert_eq!(outcome.unwrap(), Err("unreachable host"));
/// }
///
/// assert_eq!(breaker.phase(), CircuitPhase::Open);
/// assert!(breaker.call(|| async { Ok::<_, &str>(()) }).await.is_err());
/// # });
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<State>,
    fail_threshold: u32,
    timeout: Duration,
    clock: Clock,
    telemetry: Telemetry,
}

#[derive(Debug)]
struct State {
    phase: CircuitPhase,
    consecutive_failures: u32,
    last_failure: Option<Failure>,
    trial_in_flight: bool,
    // Bumped by `reset`; outcomes of calls admitted before a reset are ignored.
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct Failure {
    at: Instant,
    wall_clock: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    Trial,
}

#[derive(Debug)]
enum Enter {
    Accepted { mode: Mode, generation: u64, half_opened: bool },
    Rejected { retry_after: Duration },
}

#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Unchanged,
    Opened { failures: u32 },
    Closed,
}

impl CircuitBreaker {
    /// Creates a closed circuit that opens after `fail_threshold` consecutive failures and
    /// admits a trial call `timeout` after the last failure.
    ///
    /// A `fail_threshold` of zero is treated as one.
    #[must_use]
    pub fn new(fail_threshold: u32, timeout: Duration, clock: &Clock) -> Self {
        Self {
            state: Mutex::new(State {
                phase: CircuitPhase::Closed,
                consecutive_failures: 0,
                last_failure: None,
                trial_in_flight: false,
                generation: 0,
            }),
            fail_threshold: fail_threshold.max(1),
            timeout,
            clock: clock.clone(),
            telemetry: Telemetry::disabled(),
        }
    }

    pub(crate) fn with_telemetry(self, telemetry: Telemetry) -> Self {
        Self { telemetry, ..self }
    }

    /// Runs `operation` through the circuit.
    ///
    /// The outer `Result` reports admission: [`CircuitOpenError`] means `operation` was never
    /// invoked. The inner `Result` is the operation's own outcome, returned unchanged after it
    /// has been recorded.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitOpenError`] if the circuit is open, or half-open with a trial call
    /// already in flight.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<Result<T, E>, CircuitOpenError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.enter()?;
        let outcome = operation().await;
        permit.exit(outcome.is_ok());

        Ok(outcome)
    }

    /// Returns the current phase.
    ///
    /// An open circuit whose cooldown has elapsed still reports [`CircuitPhase::Open`] until the
    /// next call turns it half-open.
    #[must_use]
    pub fn phase(&self) -> CircuitPhase {
        self.state.lock().phase
    }

    /// Returns the number of failures recorded since the circuit last closed after a trial call,
    /// or was reset.
    ///
    /// Successful calls while the circuit is closed leave the count unchanged.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Returns the consecutive failures that open the circuit.
    #[must_use]
    pub fn fail_threshold(&self) -> u32 {
        self.fail_threshold
    }

    /// Returns the cooldown an open circuit waits before admitting a trial call.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Forces the circuit closed and forgets all recorded failures.
    ///
    /// Calls that were admitted before the reset and are still running do not affect the
    /// circuit when they complete.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.phase = CircuitPhase::Closed;
        state.consecutive_failures = 0;
        state.last_failure = None;
        state.trial_in_flight = false;
        state.generation = state.generation.wrapping_add(1);
    }

    /// Returns the current state of the circuit.
    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        let state = self.state.lock();

        CircuitStats {
            phase: state.phase,
            consecutive_failures: state.consecutive_failures,
            fail_threshold: self.fail_threshold,
            last_failure_at: state.last_failure.map(|failure| failure.wall_clock),
        }
    }

    fn enter(&self) -> Result<Permit<'_>, CircuitOpenError> {
        let now = self.clock.instant();
        let enter = self.state.lock().enter(now, self.timeout);

        match enter {
            Enter::Accepted {
                mode,
                generation,
                half_opened,
            } => {
                if half_opened {
                    self.telemetry.report(Event::CircuitHalfOpen);
                    log_event!(self.telemetry, tracing::Level::INFO, "circuit_half_open");
                }

                Ok(Permit {
                    breaker: self,
                    mode,
                    generation,
                    completed: false,
                })
            }
            Enter::Rejected { retry_after } => {
                self.telemetry.report(Event::CircuitRejected);
                log_event!(
                    self.telemetry,
                    tracing::Level::WARN,
                    "circuit_rejected",
                    circuit.retry_after = retry_after.as_secs_f32()
                );

                Err(CircuitOpenError::new(retry_after))
            }
        }
    }

    #[cfg_attr(not(any(feature = "logs", test)), expect(unused_variables, reason = "failure count is only logged"))]
    fn exit(&self, mode: Mode, generation: u64, success: bool) {
        let now = self.clock.instant();
        let wall_clock = self.clock.system_time();

        let exit = self.state.lock().exit(
            mode,
            generation,
            success,
            Failure { at: now, wall_clock },
            self.fail_threshold,
        );

        match exit {
            Exit::Unchanged => {}
            Exit::Opened { failures } => {
                self.telemetry.report(Event::CircuitOpened);
                log_event!(
                    self.telemetry,
                    tracing::Level::WARN,
                    "circuit_opened",
                    circuit.failures = failures,
                    circuit.timeout = self.timeout.as_secs_f32()
                );
            }
            Exit::Closed => {
                self.telemetry.report(Event::CircuitClosed);
                log_event!(self.telemetry, tracing::Level::INFO, "circuit_closed");
            }
        }
    }

    fn abandon(&self, mode: Mode, generation: u64) {
        if mode == Mode::Trial {
            let mut state = self.state.lock();
            if state.generation == generation {
                state.trial_in_flight = false;
            }
        }
    }
}

impl State {
    fn enter(&mut self, now: Instant, timeout: Duration) -> Enter {
        match self.phase {
            CircuitPhase::Closed => Enter::Accepted {
                mode: Mode::Normal,
                generation: self.generation,
                half_opened: false,
            },
            CircuitPhase::Open => {
                let elapsed = self
                    .last_failure
                    .map_or(timeout, |failure| now.saturating_duration_since(failure.at));

                if elapsed >= timeout {
                    self.phase = CircuitPhase::HalfOpen;
                    self.trial_in_flight = true;
                    Enter::Accepted {
                        mode: Mode::Trial,
                        generation: self.generation,
                        half_opened: true,
                    }
                } else {
                    Enter::Rejected {
                        retry_after: timeout.saturating_sub(elapsed),
                    }
                }
            }
            CircuitPhase::HalfOpen if self.trial_in_flight => Enter::Rejected {
                retry_after: Duration::ZERO,
            },
            // The previous trial call was abandoned; admit another one.
            CircuitPhase::HalfOpen => {
                self.trial_in_flight = true;
                Enter::Accepted {
                    mode: Mode::Trial,
                    generation: self.generation,
                    half_opened: false,
                }
            }
        }
    }

    fn exit(&mut self, mode: Mode, generation: u64, success: bool, failure: Failure, fail_threshold: u32) -> Exit {
        if generation != self.generation {
            return Exit::Unchanged;
        }

        match (mode, self.phase) {
            (Mode::Trial, _) => {
                self.trial_in_flight = false;

                if success {
                    self.phase = CircuitPhase::Closed;
                    self.consecutive_failures = 0;
                    Exit::Closed
                } else {
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                    self.last_failure = Some(failure);
                    self.phase = CircuitPhase::Open;
                    Exit::Opened {
                        failures: self.consecutive_failures,
                    }
                }
            }
            (Mode::Normal, CircuitPhase::Closed) => {
                // Only a successful trial clears the count.
                if success {
                    return Exit::Unchanged;
                }

                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_failure = Some(failure);

                if self.consecutive_failures >= fail_threshold {
                    self.phase = CircuitPhase::Open;
                    Exit::Opened {
                        failures: self.consecutive_failures,
                    }
                } else {
                    Exit::Unchanged
                }
            }
            // Admitted while closed but finished after another call opened the circuit.
            (Mode::Normal, CircuitPhase::Open | CircuitPhase::HalfOpen) => Exit::Unchanged,
        }
    }
}

/// Admission to run one call; records the outcome on `exit` or frees a trial slot on drop.
#[derive(Debug)]
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    mode: Mode,
    generation: u64,
    completed: bool,
}

impl Permit<'_> {
    fn exit(mut self, success: bool) {
        self.completed = true;
        self.breaker.exit(self.mode, self.generation, success);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.breaker.abandon(self.mode, self.generation);
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::future::pending;
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures::FutureExt;
    use opentelemetry::KeyValue;
    use tick::ClockControl;

    use super::*;
    use crate::telemetry::EVENT_NAME;
    use crate::testing::{LogCapture, MetricTester};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn breaker() -> (CircuitBreaker, ClockControl) {
        let control = ClockControl::new();
        (CircuitBreaker::new(3, TIMEOUT, &control.to_clock()), control)
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<Result<(), &'static str>, CircuitOpenError> {
        breaker.call(|| async { Err("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<Result<u32, &'static str>, CircuitOpenError> {
        breaker.call(|| async { Ok(7) }).await
    }

    async fn trip(breaker: &CircuitBreaker) {
        for _ in 0..breaker.fail_threshold() {
            assert_eq!(fail(breaker).await.unwrap(), Err("boom"));
        }
        assert_eq!(breaker.phase(), CircuitPhase::Open);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let (breaker, _) = breaker();

        assert_eq!(fail(&breaker).await.unwrap(), Err("boom"));
        assert_eq!(fail(&breaker).await.unwrap(), Err("boom"));
        assert_eq!(breaker.phase(), CircuitPhase::Closed);
        assert_eq!(breaker.consecutive_failures(), 2);

        assert_eq!(fail(&breaker).await.unwrap(), Err("boom"));
        assert_eq!(breaker.phase(), CircuitPhase::Open);
    }

    #[tokio::test]
    async fn open_circuit_does_not_invoke_operation() {
        let (breaker, control) = breaker();
        trip(&breaker).await;
        control.advance(Duration::from_secs(2));

        let invoked = AtomicU32::new(0);
        let error = breaker
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ()>(())
            })
            .await
            .unwrap_err();

        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(error.retry_after(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn successful_trial_closes_circuit() {
        let (breaker, control) = breaker();
        trip(&breaker).await;
        control.advance(TIMEOUT);

        assert_eq!(succeed(&breaker).await.unwrap(), Ok(7));

        assert_eq!(breaker.phase(), CircuitPhase::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn failed_trial_reopens_and_restarts_cooldown() {
        let (breaker, control) = breaker();
        trip(&breaker).await;
        control.advance(TIMEOUT);

        assert_eq!(fail(&breaker).await.unwrap(), Err("boom"));
        assert_eq!(breaker.phase(), CircuitPhase::Open);

        control.advance(TIMEOUT - Duration::from_millis(1));
        assert!(succeed(&breaker).await.is_err());

        control.advance(Duration::from_millis(1));
        assert_eq!(succeed(&breaker).await.unwrap(), Ok(7));
        assert_eq!(breaker.phase(), CircuitPhase::Closed);
    }

    #[tokio::test]
    async fn only_one_trial_at_a_time() {
        let (breaker, control) = breaker();
        trip(&breaker).await;
        control.advance(TIMEOUT);

        let (release, released) = futures::channel::oneshot::channel::<()>();
        let trial = breaker.call(|| async {
            released.await.unwrap();
            Ok::<_, &str>(1)
        });
        futures::pin_mut!(trial);
        assert!(trial.as_mut().now_or_never().is_none());
        assert_eq!(breaker.phase(), CircuitPhase::HalfOpen);

        let rejected = succeed(&breaker).await.unwrap_err();
        assert_eq!(rejected.retry_after(), Duration::ZERO);

        release.send(()).unwrap();
        assert_eq!(trial.await.unwrap(), Ok(1));
        assert_eq!(breaker.phase(), CircuitPhase::Closed);
    }

    #[tokio::test]
    async fn abandoned_trial_frees_the_slot() {
        let (breaker, control) = breaker();
        trip(&breaker).await;
        control.advance(TIMEOUT);

        {
            let trial = breaker.call(|| pending::<Result<(), ()>>());
            futures::pin_mut!(trial);
            assert!(trial.as_mut().now_or_never().is_none());
        }

        assert_eq!(breaker.phase(), CircuitPhase::HalfOpen);
        assert_eq!(succeed(&breaker).await.unwrap(), Ok(7));
        assert_eq!(breaker.phase(), CircuitPhase::Closed);
    }

    #[tokio::test]
    async fn successes_while_closed_keep_the_count() {
        let (breaker, _) = breaker();

        for _ in 0..2 {
            assert_eq!(fail(&breaker).await.unwrap(), Err("boom"));
            assert_eq!(succeed(&breaker).await.unwrap(), Ok(7));
        }
        assert_eq!(breaker.consecutive_failures(), 2);
        assert_eq!(breaker.phase(), CircuitPhase::Closed);

        assert_eq!(fail(&breaker).await.unwrap(), Err("boom"));
        assert_eq!(breaker.phase(), CircuitPhase::Open);
    }

    #[tokio::test]
    async fn late_result_after_opening_is_ignored() {
        let (breaker, control) = breaker();

        let (release, released) = futures::channel::oneshot::channel::<()>();
        let slow = breaker.call(|| async {
            released.await.unwrap();
            Ok::<_, &str>(1)
        });
        futures::pin_mut!(slow);
        assert!(slow.as_mut().now_or_never().is_none());

        trip(&breaker).await;
        release.send(()).unwrap();
        assert_eq!(slow.await.unwrap(), Ok(1));

        assert_eq!(breaker.phase(), CircuitPhase::Open);
        control.advance(Duration::from_secs(1));
        assert!(succeed(&breaker).await.is_err());
    }

    #[tokio::test]
    async fn reset_closes_and_forgets() {
        let (breaker, _) = breaker();
        trip(&breaker).await;

        breaker.reset();

        let stats = breaker.stats();
        assert_eq!(stats.phase, CircuitPhase::Closed);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.last_failure_at, None);
        assert_eq!(succeed(&breaker).await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn calls_admitted_before_reset_are_ignored() {
        let (breaker, _) = breaker();

        let (release, released) = futures::channel::oneshot::channel::<()>();
        let slow = breaker.call(|| async {
            released.await.unwrap();
            Err::<(), _>("boom")
        });
        futures::pin_mut!(slow);
        assert!(slow.as_mut().now_or_never().is_none());

        breaker.reset();
        release.send(()).unwrap();
        let _ = slow.await;

        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn stats_report_last_failure() {
        let (breaker, control) = breaker();
        let before = control.to_clock().system_time();
        let _ = fail(&breaker).await;

        let stats = breaker.stats();
        assert_eq!(stats.fail_threshold, 3);
        assert_eq!(stats.consecutive_failures, 1);
        assert_eq!(stats.last_failure_at, Some(before));

        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["phase"], "closed");
    }

    #[test]
    fn zero_threshold_is_treated_as_one() {
        let breaker = CircuitBreaker::new(0, TIMEOUT, &ClockControl::new().to_clock());

        assert_eq!(breaker.fail_threshold(), 1);
        assert_eq!(breaker.timeout(), TIMEOUT);
    }

    #[tokio::test]
    async fn transitions_are_reported() {
        use tracing_subscriber::util::SubscriberInitExt;

        let capture = LogCapture::new();
        let _guard = capture.subscriber().set_default();
        let tester = MetricTester::new();

        let control = ClockControl::new();
        let telemetry = Telemetry::new(Cow::Borrowed("breaker_test"))
            .with_logs()
            .with_metrics(&crate::telemetry::create_meter(tester.meter_provider()));
        let breaker = CircuitBreaker::new(1, TIMEOUT, &control.to_clock()).with_telemetry(telemetry);

        let _ = fail(&breaker).await;
        let _ = succeed(&breaker).await;
        control.advance(TIMEOUT);
        let _ = succeed(&breaker).await;

        for event in ["circuit_opened", "circuit_rejected", "circuit_half_open", "circuit_closed"] {
            capture.assert_contains(event);
            assert_eq!(tester.event_count(&KeyValue::new(EVENT_NAME, event)), 1, "{event}");
        }
        capture.assert_contains("breaker_test");
        capture.assert_contains("circuit.failures=1");
    }

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(CircuitBreaker: Send, Sync, std::fmt::Debug);
    }
}
