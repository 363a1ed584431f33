//! Configuration Module
//!
//! Environment-driven configuration for the ingestor binaries.

mod settings;

pub use settings::{
    BrokerEnvironment, BrokerSettings, ConfigError, DEFAULT_SYMBOLS, IngestorConfig,
    RedisSettings, parse_aliases, parse_symbols,
};
