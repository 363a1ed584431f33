//! Prometheus Metrics Module
//!
//! Exposes ingestor metrics in Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Messages**: Frames received from the broker by payload type
//! - **Requests**: Broker requests by kind and outcome, with latency
//! - **Connection**: Session state and restarts
//! - **Sinks**: Ticks forwarded or dropped, heartbeats written, sink failures
//!
//! # Integration
//!
//! Metrics are served at `/metrics` by the exporter's own HTTP listener.
//! Without [`init_metrics`] every recording call is a no-op.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// =============================================================================
// Initialization
// =============================================================================

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Install the Prometheus recorder with an HTTP listener on `port`.
///
/// Must be called from within a Tokio runtime. Calling it again is a
/// no-op that returns the first listener address.
///
/// # Errors
///
/// Returns an error if the recorder or listener cannot be installed.
pub fn init_metrics(port: u16) -> Result<SocketAddr, BuildError> {
    if let Some(addr) = INSTALLED.get() {
        return Ok(*addr);
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    register_metrics();

    Ok(*INSTALLED.get_or_init(|| addr))
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Message counters
    describe_counter!(
        "ctrader_ingestor_messages_received_total",
        "Total frames received from the broker by payload type"
    );
    describe_counter!(
        "ctrader_ingestor_responses_discarded_total",
        "Responses dropped because no request was waiting for them"
    );

    // Request metrics
    describe_counter!(
        "ctrader_ingestor_requests_total",
        "Broker requests by kind and outcome"
    );
    describe_histogram!(
        "ctrader_ingestor_request_duration_seconds",
        "Time from request to completion"
    );

    // Connection metrics
    describe_gauge!(
        "ctrader_ingestor_connection_state",
        "Session state (0 disconnected, 1 connecting, 2 app auth, 3 account auth, 4 ready)"
    );
    describe_counter!(
        "ctrader_ingestor_restarts_total",
        "Total session restarts by the ingestor"
    );
    describe_gauge!(
        "ctrader_ingestor_subscriptions",
        "Instruments covered by the live subscription"
    );

    // Sink metrics
    describe_counter!(
        "ctrader_ingestor_ticks_forwarded_total",
        "Ticks appended to the tick sink"
    );
    describe_counter!(
        "ctrader_ingestor_ticks_dropped_total",
        "Ticks dropped because the event receiver was full"
    );
    describe_counter!(
        "ctrader_ingestor_sink_errors_total",
        "Sink write failures by sink"
    );
    describe_counter!(
        "ctrader_ingestor_heartbeats_written_total",
        "Liveness heartbeats written"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for broker request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Authentication handshake.
    Auth,
    /// Full symbol list.
    SymbolList,
    /// Symbol details.
    SymbolDetails,
    /// Historical bars.
    History,
    /// Spot subscription.
    Subscribe,
}

impl RequestKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::SymbolList => "symbol_list",
            Self::SymbolDetails => "symbol_details",
            Self::History => "history",
            Self::Subscribe => "subscribe",
        }
    }
}

/// Metric labels for request outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completed.
    Ok,
    /// Broker returned an error.
    Error,
    /// Deadline passed.
    Timeout,
    /// Rejected because the blocking slot was taken.
    Busy,
    /// Connection dropped while waiting.
    Disconnected,
}

impl Outcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Busy => "busy",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Metric labels for sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// Tick sink.
    Tick,
    /// Heartbeat sink.
    Heartbeat,
}

impl SinkKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Tick => "tick",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Record a frame received from the broker.
pub fn record_message_received(payload: &'static str) {
    counter!(
        "ctrader_ingestor_messages_received_total",
        "payload" => payload
    )
    .increment(1);
}

/// Record a response nobody was waiting for.
pub fn record_response_discarded() {
    counter!("ctrader_ingestor_responses_discarded_total").increment(1);
}

/// Record a finished broker request.
pub fn record_request(kind: RequestKind, outcome: Outcome) {
    counter!(
        "ctrader_ingestor_requests_total",
        "kind" => kind.as_str(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record request latency.
pub fn record_request_duration(kind: RequestKind, duration: Duration) {
    histogram!(
        "ctrader_ingestor_request_duration_seconds",
        "kind" => kind.as_str()
    )
    .record(duration.as_secs_f64());
}

/// Update the session state gauge.
pub fn set_connection_state(level: f64) {
    gauge!("ctrader_ingestor_connection_state").set(level);
}

/// Update the subscription gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(count: usize) {
    gauge!("ctrader_ingestor_subscriptions").set(count as f64);
}

/// Record a session restart.
pub fn record_restart() {
    counter!("ctrader_ingestor_restarts_total").increment(1);
}

/// Record a tick appended to the sink.
pub fn record_tick_forwarded(symbol: &str) {
    counter!(
        "ctrader_ingestor_ticks_forwarded_total",
        "symbol" => symbol.to_string()
    )
    .increment(1);
}

/// Record a tick dropped before reaching the event receiver.
pub fn record_tick_dropped() {
    counter!("ctrader_ingestor_ticks_dropped_total").increment(1);
}

/// Record a sink write failure.
pub fn record_sink_error(sink: SinkKind) {
    counter!(
        "ctrader_ingestor_sink_errors_total",
        "sink" => sink.as_str()
    )
    .increment(1);
}

/// Record a heartbeat written.
pub fn record_heartbeat_written() {
    counter!("ctrader_ingestor_heartbeats_written_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================
