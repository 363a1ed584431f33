//! Port Interfaces
//!
//! Defines the interfaces (ports) between the ingestor core and the
//! systems around it, following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `TickSink`: durable per-symbol append log for live ticks
//! - `HeartbeatSink`: short-lived liveness marker
//!
//! ## Driver Ports (Inbound)
//!
//! - `MarketDataSource`: history and symbol queries for callers

mod heartbeat_sink_port;
mod market_data_port;
mod tick_sink_port;

pub use heartbeat_sink_port::{HeartbeatSink, InMemoryHeartbeatSink};
pub use market_data_port::{MarketDataError, MarketDataSource, SyntheticMarketData};
pub use tick_sink_port::{InMemoryTickSink, SinkError, TickSink};
