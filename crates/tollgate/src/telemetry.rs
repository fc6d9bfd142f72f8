// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Telemetry keys and event reporting for the gateway.
//!
//! Events are emitted as structured `tracing` events named `tollgate.<event>` when logs are
//! enabled, and counted on the `tollgate.event` OpenTelemetry counter when metrics are enabled.
//! Both are opt-in through [`GatewayOptions`][crate::GatewayOptions].

use std::borrow::Cow;

/// Key used to annotate the name of the gateway that emitted an event.
///
/// Values reported under this dimension should be short, preferably in `snake_case`.
/// Examples: `scoring`, `embeddings`.
pub const GATEWAY_NAME: &str = "tollgate.gateway.name";

/// Key used to annotate the event being reported.
///
/// Values are the `snake_case` names of [`Event`]: `cache_hit`, `retry`, `circuit_opened`, and so on.
pub const EVENT_NAME: &str = "tollgate.event.name";

#[cfg(any(feature = "metrics", test))]
const METER_NAME: &str = "tollgate";
#[cfg(any(feature = "metrics", test))]
const VERSION: &str = "v0.1.0";
#[cfg(any(feature = "metrics", test))]
const SCHEMA_URL: &str = "https://opentelemetry.io/schemas/1.47.0";

/// Something noteworthy that happened while serving an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Event {
    /// A cached result was returned.
    CacheHit,
    /// No usable cached result existed.
    CacheMiss,
    /// The caller waited for the rate limiter to refill.
    RateLimitWait,
    /// No token was available after waiting.
    RateLimitExceeded,
    /// The circuit breaker opened.
    CircuitOpened,
    /// The circuit breaker admitted a trial call.
    CircuitHalfOpen,
    /// The circuit breaker closed after a successful trial call.
    CircuitClosed,
    /// The circuit breaker rejected a call.
    CircuitRejected,
    /// A failed attempt is about to be retried.
    Retry,
    /// The caller's deadline cut the invocation short.
    DeadlineExceeded,
}

impl Event {
    /// Returns the `snake_case` name reported for the event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CacheHit => "cache_hit",
            Self::CacheMiss => "cache_miss",
            Self::RateLimitWait => "rate_limit_wait",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::CircuitOpened => "circuit_opened",
            Self::CircuitHalfOpen => "circuit_half_open",
            Self::CircuitClosed => "circuit_closed",
            Self::CircuitRejected => "circuit_rejected",
            Self::Retry => "retry",
            Self::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

/// Per-gateway reporting handle shared by the gateway and its components.
#[derive(Debug, Clone)]
pub(crate) struct Telemetry {
    pub(crate) gateway_name: Cow<'static, str>,
    #[cfg(any(feature = "metrics", test))]
    event_reporter: Option<opentelemetry::metrics::Counter<u64>>,
    #[cfg(any(feature = "logs", test))]
    logs_enabled: bool,
}

impl Telemetry {
    pub(crate) fn disabled() -> Self {
        Self::new(Cow::Borrowed(crate::options::DEFAULT_GATEWAY_NAME))
    }

    pub(crate) fn new(gateway_name: Cow<'static, str>) -> Self {
        Self {
            gateway_name,
            #[cfg(any(feature = "metrics", test))]
            event_reporter: None,
            #[cfg(any(feature = "logs", test))]
            logs_enabled: false,
        }
    }

    #[cfg(any(feature = "logs", test))]
    pub(crate) fn with_logs(self) -> Self {
        Self {
            logs_enabled: true,
            ..self
        }
    }

    #[cfg(any(feature = "metrics", test))]
    pub(crate) fn with_metrics(self, meter: &opentelemetry::metrics::Meter) -> Self {
        Self {
            event_reporter: Some(create_event_counter(meter)),
            ..self
        }
    }

    #[cfg(any(feature = "logs", test))]
    pub(crate) fn logs_enabled(&self) -> bool {
        self.logs_enabled
    }

    #[cfg_attr(not(any(feature = "metrics", test)), expect(unused_variables, reason = "no-op without metrics"))]
    pub(crate) fn report(&self, event: Event) {
        #[cfg(any(feature = "metrics", test))]
        if let Some(reporter) = &self.event_reporter {
            reporter.add(
                1,
                &[
                    opentelemetry::KeyValue::new(GATEWAY_NAME, self.gateway_name.clone()),
                    opentelemetry::KeyValue::new(EVENT_NAME, event.as_str()),
                ],
            );
        }
    }
}

/// Emits a `tollgate.<event>` tracing event when logs are enabled for the gateway.
macro_rules! log_event {
    ($telemetry:expr, $level:expr, $event:literal $(, $($fields:tt)+)?) => {
        #[cfg(any(feature = "logs", test))]
        if $telemetry.logs_enabled() {
            tracing::event!(
                name: concat!("tollgate.", $event),
                $level,
                gateway.name = %$telemetry.gateway_name,
                gateway.event = $event
                $(, $($fields)+)?
            );
        }
    };
}

pub(crate) use log_event;

#[cfg(any(feature = "metrics", test))]
pub(crate) fn create_meter(meter_provider: &dyn opentelemetry::metrics::MeterProvider) -> opentelemetry::metrics::Meter {
    meter_provider.meter_with_scope(
        opentelemetry::InstrumentationScope::builder(METER_NAME)
            .with_version(VERSION)
            .with_schema_url(SCHEMA_URL)
            .build(),
    )
}

#[cfg(any(feature = "metrics", test))]
fn create_event_counter(meter: &opentelemetry::metrics::Meter) -> opentelemetry::metrics::Counter<u64> {
    meter
        .u64_counter("tollgate.event")
        .with_description("Emitted upon the occurrence of a gateway event.")
        .with_unit("u64")
        .build()
}
