// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use recoverable::RecoveryInfo;
use tick::Clock;

use crate::telemetry::Telemetry;

pub(crate) const DEFAULT_GATEWAY_NAME: &str = "default";

type Classifier<E> = Arc<dyn Fn(&E) -> RecoveryInfo + Send + Sync>;

/// Dependencies and behavior switches of a [`Gateway`][crate::Gateway].
///
/// Where [`GatewayConfig`][crate::GatewayConfig] carries plain data, the options carry what
/// cannot be deserialized: the clock, telemetry sinks and the error classifier.
///
/// # Examples
///
/// ```
/// use recoverable::RecoveryInfo;
/// use tick::Clock;
/// use tollgate::GatewayOptions;
///
/// #[derive(Debug)]
/// enum ApiError {
///     BadRequest,
///     Overloaded,
/// }
///
/// let options = GatewayOptions::<ApiError>::new(Clock::new_frozen())
///     .name("scoring")
///     .recovery_with(|error| match error {
///         ApiError::BadRequest => RecoveryInfo::never(),
///         ApiError::Overloaded => RecoveryInfo::retry(),
///     });
/// ```
pub struct GatewayOptions<E> {
    clock: Clock,
    name: Cow<'static, str>,
    #[cfg(any(feature = "metrics", test))]
    meter: Option<opentelemetry::metrics::Meter>,
    #[cfg(any(feature = "logs", test))]
    logs_enabled: bool,
    classifier: Option<Classifier<E>>,
    retry_when_circuit_open: bool,
}

impl<E> GatewayOptions<E> {
    /// Creates options using `clock` for every time measurement and delay. The gateway is
    /// named `"default"`.
    pub fn new(clock: impl AsRef<Clock>) -> Self {
        Self {
            clock: clock.as_ref().clone(),
            name: Cow::Borrowed(DEFAULT_GATEWAY_NAME),
            #[cfg(any(feature = "metrics", test))]
            meter: None,
            #[cfg(any(feature = "logs", test))]
            logs_enabled: false,
            classifier: None,
            retry_when_circuit_open: false,
        }
    }

    /// Sets the gateway name reported with every telemetry event. Prefer `snake_case`.
    #[must_use]
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Enables structured logging of gateway events.
    #[must_use]
    #[cfg(any(feature = "logs", test))]
    pub fn use_logs(self) -> Self {
        Self {
            logs_enabled: true,
            ..self
        }
    }

    /// Enables metrics reporting through the given OpenTelemetry meter provider.
    #[must_use]
    #[cfg(any(feature = "metrics", test))]
    pub fn use_metrics(self, provider: &dyn opentelemetry::metrics::MeterProvider) -> Self {
        Self {
            meter: Some(crate::telemetry::create_meter(provider)),
            ..self
        }
    }

    /// Decides whether a failure of the wrapped operation is worth retrying.
    ///
    /// Failures classified as [`RecoveryKind::Retry`][recoverable::RecoveryKind::Retry] are
    /// retried, after the classifier's delay if it supplies one. By default every failure of
    /// the wrapped operation is retried.
    #[must_use]
    pub fn recovery_with(mut self, classify: impl Fn(&E) -> RecoveryInfo + Send + Sync + 'static) -> Self {
        self.classifier = Some(Arc::new(classify));
        self
    }

    /// Retries calls rejected by an open circuit, waiting out the remaining cooldown.
    ///
    /// Off by default: a rejected call fails immediately so that callers do not sleep through
    /// an outage the breaker already detected.
    #[must_use]
    pub fn retry_when_circuit_open(mut self, enabled: bool) -> Self {
        self.retry_when_circuit_open = enabled;
        self
    }

    pub(crate) fn clock(&self) -> &Clock {
        &self.clock
    }

    pub(crate) fn gateway_name(&self) -> &str {
        &self.name
    }

    pub(crate) fn retries_when_circuit_open(&self) -> bool {
        self.retry_when_circuit_open
    }

    pub(crate) fn classify(&self, error: &E) -> RecoveryInfo {
        self.classifier.as_ref().map_or_else(RecoveryInfo::retry, |classify| classify(error))
    }

    pub(crate) fn create_telemetry(&self) -> Telemetry {
        let telemetry = Telemetry::new(self.name.clone());

        #[cfg(any(feature = "logs", test))]
        let telemetry = if self.logs_enabled { telemetry.with_logs() } else { telemetry };

        #[cfg(any(feature = "metrics", test))]
        let telemetry = match &self.meter {
            Some(meter) => telemetry.with_metrics(meter),
            None => telemetry,
        };

        telemetry
    }
}

impl<E> Debug for GatewayOptions<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayOptions")
            .field("clock", &self.clock)
            .field("name", &self.name)
            .field("custom_recovery", &self.classifier.is_some())
            .field("retry_when_circuit_open", &self.retry_when_circuit_open)
            .finish_non_exhaustive()
    }
}

/// Per-invocation settings for [`Gateway::invoke_with`][crate::Gateway::invoke_with].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use tollgate::InvokeOptions;
///
/// let options = InvokeOptions::new().bypass_cache().deadline(Duration::from_secs(30));
/// assert!(!options.uses_cache());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvokeOptions {
    bypass_cache: bool,
    deadline: Option<Duration>,
}

impl InvokeOptions {
    /// Creates default options: the cache is used and there is no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Neither reads from nor writes to the cache.
    #[must_use]
    pub fn bypass_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }

    /// Gives up once `deadline` has elapsed since the invocation started.
    ///
    /// The deadline is checked before every wait: a rate-limit wait that would end after it
    /// fails with [`InvokeError::DeadlineExceeded`][crate::InvokeError::DeadlineExceeded], and a
    /// retry delay that would end after it stops the retries and returns the last failure.
    /// A call already running is never interrupted.
    #[must_use]
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Returns whether the cache is consulted.
    #[must_use]
    pub fn uses_cache(&self) -> bool {
        !self.bypass_cache
    }

    /// Returns the configured deadline, if any.
    #[must_use]
    pub fn get_deadline(&self) -> Option<Duration> {
        self.deadline
    }
}
