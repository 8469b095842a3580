//! Metric events and the sinks that consume them.
//!
//! The server and handler never talk to a metrics system directly; they emit
//! [`MetricEvent`]s into an injected sink. Sinks are `tower` services so they
//! compose and can apply backpressure, but emission is always best-effort:
//! a failing sink never affects request handling.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::future::{ready, Ready};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tower::Service;

/// One statsd-shaped measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricEvent {
    /// Bump a counter by one.
    Increment {
        /// Counter name, e.g. `hit.accepted.rule`.
        name: String,
    },
    /// Report the current value of a gauge.
    Gauge {
        /// Gauge name, e.g. `connections`.
        name: String,
        /// Observed value.
        value: i64,
    },
    /// Report an elapsed duration.
    Timing {
        /// Timer name, e.g. `hit`.
        name: String,
        /// Elapsed milliseconds.
        millis: u64,
    },
}

impl MetricEvent {
    /// The metric name, regardless of kind.
    pub fn name(&self) -> &str {
        match self {
            MetricEvent::Increment { name }
            | MetricEvent::Gauge { name, .. }
            | MetricEvent::Timing { name, .. } => name,
        }
    }
}

impl fmt::Display for MetricEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricEvent::Increment { name } => write!(f, "{}:+1", name),
            MetricEvent::Gauge { name, value } => write!(f, "{}={}", name, value),
            MetricEvent::Timing { name, millis } => write!(f, "{}:{}ms", name, millis),
        }
    }
}

/// A sink that consumes metric events.
pub trait MetricsSink:
    Service<MetricEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Deliver one event and discard the outcome. A sink that is not ready or
/// that fails loses the event; request handling is never held up for it.
pub async fn emit<S>(sink: &S, event: MetricEvent)
where
    S: MetricsSink,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    let _ = sink.clone().oneshot(event).await;
}

/// Bump a counter.
pub async fn increment<S>(sink: &S, name: impl Into<String>)
where
    S: MetricsSink,
    S::Future: Send + 'static,
{
    emit(sink, MetricEvent::Increment { name: name.into() }).await;
}

/// Report a gauge value.
pub async fn gauge<S>(sink: &S, name: impl Into<String>, value: i64)
where
    S: MetricsSink,
    S::Future: Send + 'static,
{
    emit(sink, MetricEvent::Gauge { name: name.into(), value }).await;
}

/// Report an elapsed duration.
pub async fn timing<S>(sink: &S, name: impl Into<String>, millis: u64)
where
    S: MetricsSink,
    S::Future: Send + 'static,
{
    emit(sink, MetricEvent::Timing { name: name.into(), millis }).await;
}

/// A no-op sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<MetricEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: MetricEvent) -> Self::Future {
        ready(Ok(()))
    }
}

impl MetricsSink for NullSink {
    type SinkError = Infallible;
}

/// A sink that logs every event through `tracing` at debug level, with the
/// event kind as a structured field.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<MetricEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: MetricEvent) -> Self::Future {
        match &event {
            MetricEvent::Increment { name } => {
                tracing::debug!(target: "divvy::metrics", counter = %name, "increment");
            }
            MetricEvent::Gauge { name, value } => {
                tracing::debug!(target: "divvy::metrics", gauge = %name, value, "gauge");
            }
            MetricEvent::Timing { name, millis } => {
                tracing::debug!(target: "divvy::metrics", timer = %name, millis, "timing");
            }
        }
        ready(Ok(()))
    }
}

impl MetricsSink for LogSink {
    type SinkError = Infallible;
}

/// Aggregated per-name recordings, as tests want to query them.
#[derive(Debug, Default)]
struct Recorded {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, Vec<i64>>,
    timings: HashMap<String, Vec<u64>>,
}

/// A sink that aggregates events by metric name, for tests and diagnostics.
///
/// Counters sum their increments; gauges and timers keep every observation
/// in arrival order.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    recorded: Arc<Mutex<Recorded>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total increments recorded for a counter name.
    pub fn counter(&self, name: &str) -> u64 {
        self.recorded.lock().unwrap().counters.get(name).copied().unwrap_or(0)
    }

    /// Gauge observations recorded for a name, oldest first.
    pub fn gauges(&self, name: &str) -> Vec<i64> {
        self.recorded.lock().unwrap().gauges.get(name).cloned().unwrap_or_default()
    }

    /// Timer observations recorded for a name, oldest first.
    pub fn timings(&self, name: &str) -> Vec<u64> {
        self.recorded.lock().unwrap().timings.get(name).cloned().unwrap_or_default()
    }

    /// Names of all counters seen so far, sorted.
    pub fn counter_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.recorded.lock().unwrap().counters.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop everything recorded.
    pub fn clear(&self) {
        let mut recorded = self.recorded.lock().unwrap();
        recorded.counters.clear();
        recorded.gauges.clear();
        recorded.timings.clear();
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        let recorded = self.recorded.lock().unwrap();
        recorded.counters.is_empty() && recorded.gauges.is_empty() && recorded.timings.is_empty()
    }
}

impl Service<MetricEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: MetricEvent) -> Self::Future {
        let mut recorded = self.recorded.lock().unwrap();
        match event {
            MetricEvent::Increment { name } => {
                *recorded.counters.entry(name).or_default() += 1;
            }
            MetricEvent::Gauge { name, value } => {
                recorded.gauges.entry(name).or_default().push(value);
            }
            MetricEvent::Timing { name, millis } => {
                recorded.timings.entry(name).or_default().push(millis);
            }
        }
        ready(Ok(()))
    }
}

impl MetricsSink for MemorySink {
    type SinkError = Infallible;
}
