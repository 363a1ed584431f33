//! Market Data Port (Driver Port)
//!
//! What the ingestor offers to callers that need history or the symbol
//! universe: a storage backfill job, a research notebook, a dump tool.

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

use crate::domain::market_data::{Bar, SymbolInfo};

/// Market data query error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MarketDataError {
    /// The source cannot serve the request right now.
    #[error("market data unavailable: {message}")]
    Unavailable {
        /// Error detail.
        message: String,
    },

    /// The source did not answer in time.
    #[error("market data request timed out")]
    Timeout,

    /// The request itself is invalid.
    #[error("invalid market data request: {message}")]
    InvalidRequest {
        /// Error detail.
        message: String,
    },
}

/// Port for historical and reference data.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Minute bars for `symbol` in `[start, end)`, oldest first.
    ///
    /// Unknown symbols yield an empty sequence.
    async fn fetch_history(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, MarketDataError>;

    /// Every instrument the source knows, sorted by name.
    async fn fetch_all_symbols(&self) -> Result<Vec<SymbolInfo>, MarketDataError>;
}

// =============================================================================
// Synthetic Source
// =============================================================================

const DEFAULT_MAX_BARS: usize = 100_000;

/// Random-walk market data for tests and local development.
///
/// Never used unless constructed explicitly.
#[derive(Debug)]
pub struct SyntheticMarketData {
    symbols: Vec<String>,
    start_price: Decimal,
    max_bars: usize,
    rng: Mutex<StdRng>,
}

impl SyntheticMarketData {
    /// Create a source for the given symbols, seeded for reproducibility.
    #[must_use]
    pub fn new(symbols: impl IntoIterator<Item = impl Into<String>>, seed: u64) -> Self {
        let mut symbols: Vec<String> = symbols.into_iter().map(Into::into).collect();
        symbols.sort();
        symbols.dedup();

        Self {
            symbols,
            start_price: Decimal::new(110_000, 5),
            max_bars: DEFAULT_MAX_BARS,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Set the first bar's open price.
    #[must_use]
    pub fn with_start_price(mut self, price: Decimal) -> Self {
        self.start_price = price;
        self
    }

    /// Cap the number of bars per query.
    #[must_use]
    pub fn with_max_bars(mut self, max_bars: usize) -> Self {
        self.max_bars = max_bars;
        self
    }

    fn walk(&self, symbol: &str, first: DateTime<Utc>, count: usize) -> Vec<Bar> {
        let mut rng = self.rng.lock();
        let floor = Decimal::new(1, 5);
        let mut price = self.start_price;
        let mut timestamp = first;
        let mut bars = Vec::with_capacity(count);

        for _ in 0..count {
            let open = price;
            let close = (open + Decimal::new(rng.random_range(-20..=20), 5)).max(floor);
            let high = open.max(close) + Decimal::new(rng.random_range(0..=10), 5);
            let low = (open.min(close) - Decimal::new(rng.random_range(0..=10), 5)).max(floor);

            bars.push(Bar {
                symbol: symbol.to_string(),
                timestamp,
                open,
                high,
                low,
                close,
                volume: rng.random_range(1..=1_000),
            });
            price = close;
            timestamp += Duration::minutes(1);
        }

        bars
    }
}

#[async_trait]
impl MarketDataSource for SyntheticMarketData {
    async fn fetch_history(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, MarketDataError> {
        if start > end {
            return Err(MarketDataError::InvalidRequest {
                message: format!("start {start} is after end {end}"),
            });
        }
        if !self.symbols.iter().any(|s| s == symbol) {
            return Ok(Vec::new());
        }

        let first = start
            .duration_trunc(Duration::minutes(1))
            .map_err(|e| MarketDataError::InvalidRequest {
                message: e.to_string(),
            })?;
        let first = if first < start {
            first + Duration::minutes(1)
        } else {
            first
        };

        // one bar per started minute in [first, end)
        let seconds = (end - first).num_seconds().max(0);
        let count = usize::try_from((seconds + 59) / 60).unwrap_or(usize::MAX);

        Ok(self.walk(symbol, first, count.min(self.max_bars)))
    }

    async fn fetch_all_symbols(&self) -> Result<Vec<SymbolInfo>, MarketDataError> {
        Ok(self
            .symbols
            .iter()
            .zip(1..)
            .map(|(name, id)| SymbolInfo {
                id,
                name: name.clone(),
            })
            .collect())
    }
}
