//! Application Layer - Use cases and port definitions.
//!
//! Ports describe what the ingestor needs from the outside world (sinks)
//! and what it offers (market data queries). Services run the live
//! pipeline on top of them.

/// Sink and market data port interfaces, plus in-memory test doubles.
pub mod ports;

/// Forwarding, liveness, restart and dump services.
pub mod services;
