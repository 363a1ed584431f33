//! Market Data Types
//!
//! Canonical, codec-agnostic representation of the data the ingestor
//! produces: minute bars from history queries and ticks from the live
//! spot subscription. Records are always keyed by the caller-facing
//! instrument name, never the broker's.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Broker-assigned numeric instrument identifier.
pub type SymbolId = i64;

/// One OHLCV minute bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    /// Caller-facing instrument name.
    pub symbol: String,
    /// Bar open time (minute resolution, UTC).
    pub timestamp: DateTime<Utc>,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Traded volume for the period.
    pub volume: i64,
}

/// Live price update for a subscribed instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    /// Caller-facing instrument name.
    pub symbol: String,
    /// Best bid.
    pub bid: Decimal,
    /// Best ask, when the broker sent one.
    pub ask: Option<Decimal>,
    /// Quote time (UTC).
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    /// Mid price, when both sides are known.
    #[must_use]
    pub fn mid(&self) -> Option<Decimal> {
        self.ask.map(|ask| (self.bid + ask) / Decimal::TWO)
    }
}

/// A tradable instrument as listed by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolInfo {
    /// Broker-assigned identifier.
    pub id: SymbolId,
    /// Broker-facing name.
    pub name: String,
}
