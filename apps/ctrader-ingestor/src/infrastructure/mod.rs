//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports, the broker protocol
//! client, and the process-wide plumbing (config, metrics, tracing).

/// cTrader Open API protocol client.
pub mod ctrader;

/// Redis tick and heartbeat sinks.
pub mod redis;

/// Environment-driven configuration.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Tracing and OpenTelemetry initialisation.
pub mod telemetry;
