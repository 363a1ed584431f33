#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::panic
    )
)]

//! cTrader Ingestor - Market Data Ingestion
//!
//! Keeps one authenticated connection to the cTrader Open API and uses it
//! to fetch historical minute bars, list the broker's instruments, and
//! stream live spot quotes into downstream sinks.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Market data types and symbol bookkeeping
//!   - `market_data`: Bars, ticks, symbol descriptors
//!   - `symbols`: Name resolution and alias table
//!   - `subscription`: Live spot subscription tracking
//!
//! - **Application**: Ports and services
//!   - `ports`: Tick and heartbeat sinks, market data source
//!   - `services`: Spot forwarder, liveness reporter, restart policy
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `ctrader`: Open API protocol client
//!   - `redis`: Redis tick and heartbeat sinks
//!   - `config`: Environment-driven configuration
//!   - `metrics`, `telemetry`: Observability
//!
//! # Data Flow
//!
//! ```text
//!                   +----------------+   ClientEvent   +---------------+
//! cTrader Open API  |    Session     |---------------->| SpotForwarder |--> Redis XADD tick:{symbol}
//! (protobuf / TLS)<-|  (one per      |                 +---------------+
//!                   |   connection)  |<-- Command ---- CTraderClient <-- fetch_history / subscribe
//!                   +----------------+
//!                                                      LivenessReporter --> Redis SET heartbeat EX
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Market data types with no I/O.
pub mod domain;

/// Application layer - Ports and services.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market_data::{Bar, SymbolId, SymbolInfo, Tick};
pub use domain::symbols::{SymbolAliases, SymbolDirectory};

// Ports
pub use application::ports::{
    HeartbeatSink, InMemoryHeartbeatSink, InMemoryTickSink, MarketDataError, MarketDataSource,
    SinkError, SyntheticMarketData, TickSink,
};

// Services
pub use application::services::{
    ForwarderExit, LivenessConfig, LivenessReporter, RestartConfig, RestartPolicy, SpotForwarder,
};

// Broker client
pub use infrastructure::ctrader::{
    CTraderClient, ClientConfig, ClientError, ClientEvent, ConnectionState, Credentials,
    DisconnectReason, Endpoint, Timeouts,
};

// Configuration
pub use infrastructure::config::{ConfigError, IngestorConfig};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
