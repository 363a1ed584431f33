//! Application Services
//!
//! Services that run on top of a connected client and the sink ports.
//!
//! - `SpotForwarder`: Drains client ticks into a `TickSink`
//! - `LivenessReporter`: Periodic self-expiring heartbeat
//! - `RestartPolicy`: Backoff between session restarts
//! - `write_symbol_dump`: Symbol universe to JSON

pub mod forwarder;
pub mod liveness;
pub mod restart;
pub mod symbol_dump;

pub use forwarder::{ForwarderExit, ForwarderStats, SpotForwarder};
pub use liveness::{DEFAULT_HEARTBEAT_KEY, LivenessConfig, LivenessReporter};
pub use restart::{RestartConfig, RestartPolicy};
pub use symbol_dump::{DEFAULT_DUMP_PATH, SymbolDumpError, write_symbol_dump};
