//! Price Decoding
//!
//! The Open API sends every price as an integer in 1e-5 units
//! ("relative" format), whatever the instrument's quoted precision.
//! Trendbars are further delta-encoded against the bar's low:
//!
//! ```text
//! low   = low
//! open  = low + delta_open
//! high  = low + delta_high
//! close = low + delta_close
//! ```
//!
//! All four absolutes are rebuilt as integers first, then converted to
//! [`Decimal`] and rounded to the symbol's published digits.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

use super::messages::{ProtoOaSpotEvent, ProtoOaTrendbar};
use crate::domain::market_data::Bar;
use crate::domain::subscription::SpotUpdate;
use crate::domain::symbols::RELATIVE_PRICE_DIGITS;

/// Trendbar decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PriceError {
    /// `low + delta` does not fit in an `i64`.
    #[error("price overflow in bar {index}")]
    Overflow {
        /// Position of the bar in the response.
        index: usize,
    },

    /// Bar has no open time.
    #[error("bar {index} has no timestamp")]
    MissingTimestamp {
        /// Position of the bar in the response.
        index: usize,
    },
}

// =============================================================================
// Price Scale
// =============================================================================

/// Converts relative-format integers to decimal prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceScale {
    digits: u32,
}

impl Default for PriceScale {
    fn default() -> Self {
        Self::RELATIVE
    }
}

impl PriceScale {
    /// Full relative precision (five decimals).
    pub const RELATIVE: Self = Self {
        digits: RELATIVE_PRICE_DIGITS,
    };

    /// Scale for a symbol's published digits, falling back to five
    /// decimals when unknown. Precision above the wire's is meaningless
    /// and is capped.
    #[must_use]
    pub fn for_digits(digits: Option<u32>) -> Self {
        Self {
            digits: digits.map_or(RELATIVE_PRICE_DIGITS, |d| d.min(RELATIVE_PRICE_DIGITS)),
        }
    }

    /// Decimal places of the output.
    #[must_use]
    pub const fn digits(self) -> u32 {
        self.digits
    }

    /// Convert one relative-format integer.
    #[must_use]
    pub fn to_decimal(self, raw: i64) -> Decimal {
        let price = Decimal::new(raw, RELATIVE_PRICE_DIGITS);
        if self.digits < RELATIVE_PRICE_DIGITS {
            price.round_dp_with_strategy(self.digits, RoundingStrategy::MidpointAwayFromZero)
        } else {
            price
        }
    }
}

// =============================================================================
// Trendbars
// =============================================================================

/// Decode a trendbar response into bars keyed by `symbol`.
///
/// Wire order is kept; an empty input yields an empty output.
///
/// # Errors
///
/// Returns an error if a bar has no timestamp or its prices overflow.
pub fn decode_trendbars(
    symbol: &str,
    trendbars: &[ProtoOaTrendbar],
    scale: PriceScale,
) -> Result<Vec<Bar>, PriceError> {
    trendbars
        .iter()
        .enumerate()
        .map(|(index, bar)| decode_trendbar(symbol, index, bar, scale))
        .collect()
}

fn decode_trendbar(
    symbol: &str,
    index: usize,
    bar: &ProtoOaTrendbar,
    scale: PriceScale,
) -> Result<Bar, PriceError> {
    let low = bar.low.unwrap_or_default();
    let absolute = |delta: Option<u64>| {
        i64::try_from(delta.unwrap_or_default())
            .ok()
            .and_then(|delta| low.checked_add(delta))
            .ok_or(PriceError::Overflow { index })
    };

    let open = absolute(bar.delta_open)?;
    let high = absolute(bar.delta_high)?;
    let close = absolute(bar.delta_close)?;

    let minutes = bar
        .utc_timestamp_in_minutes
        .ok_or(PriceError::MissingTimestamp { index })?;
    let timestamp = DateTime::from_timestamp(i64::from(minutes) * 60, 0)
        .ok_or(PriceError::MissingTimestamp { index })?;

    Ok(Bar {
        symbol: symbol.to_string(),
        timestamp,
        open: scale.to_decimal(open),
        high: scale.to_decimal(high),
        low: scale.to_decimal(low),
        close: scale.to_decimal(close),
        volume: bar.volume,
    })
}

// =============================================================================
// Spots
// =============================================================================

/// Decode a spot event.
///
/// Prices that do not fit an `i64` are treated as absent. Events without
/// a broker timestamp are stamped with the local clock.
#[must_use]
pub fn decode_spot(event: &ProtoOaSpotEvent, scale: PriceScale) -> SpotUpdate {
    let price = |raw: Option<u64>| {
        raw.and_then(|raw| i64::try_from(raw).ok())
            .map(|raw| scale.to_decimal(raw))
    };

    SpotUpdate {
        symbol_id: event.symbol_id,
        bid: price(event.bid),
        ask: price(event.ask),
        timestamp: event
            .timestamp
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now),
    }
}
