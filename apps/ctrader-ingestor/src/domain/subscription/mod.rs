//! Spot Subscription Tracking
//!
//! Tracks which instruments the live spot subscription covers and turns
//! raw spot updates into [`Tick`]s.
//!
//! # Design
//!
//! - Each subscribed broker identifier remembers the caller-facing name it
//!   was requested under, so ticks are keyed the way the caller asked.
//! - The broker only sends the fields that changed. A spot update without
//!   a bid reuses the last bid seen for that instrument; an update arriving
//!   before any bid is known produces no tick.
//! - The set belongs to one connection and is dropped on disconnect.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::market_data::{SymbolId, Tick};

// =============================================================================
// Types
// =============================================================================

/// State kept per subscribed instrument.
#[derive(Debug, Clone)]
struct SubscribedSymbol {
    caller_name: String,
    last_bid: Option<Decimal>,
}

/// A decoded spot update, before subscription bookkeeping is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotUpdate {
    /// Broker identifier.
    pub symbol_id: SymbolId,
    /// Bid, if it changed.
    pub bid: Option<Decimal>,
    /// Ask, if it changed.
    pub ask: Option<Decimal>,
    /// Broker timestamp.
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Spot Subscriptions
// =============================================================================

/// The set of instruments covered by the live subscription.
///
/// # Example
///
/// ```rust
/// use ctrader_ingestor::domain::subscription::{SpotSubscriptions, SpotUpdate};
/// use chrono::Utc;
/// use rust_decimal::Decimal;
///
/// let mut subscriptions = SpotSubscriptions::new();
/// assert!(subscriptions.insert(2, "NSXUSD"));
///
/// let tick = subscriptions
///     .apply(&SpotUpdate {
///         symbol_id: 2,
///         bid: Some(Decimal::new(1_812_350, 2)),
///         ask: None,
///         timestamp: Utc::now(),
///     })
///     .unwrap();
/// assert_eq!(tick.symbol, "NSXUSD");
/// ```
#[derive(Debug, Default)]
pub struct SpotSubscriptions {
    by_id: HashMap<SymbolId, SubscribedSymbol>,
}

impl SpotSubscriptions {
    /// Create an empty subscription set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instrument.
    ///
    /// Returns `false` if the identifier was already subscribed, in which
    /// case the original caller name is kept.
    pub fn insert(&mut self, id: SymbolId, caller_name: &str) -> bool {
        if self.by_id.contains_key(&id) {
            return false;
        }

        self.by_id.insert(
            id,
            SubscribedSymbol {
                caller_name: caller_name.to_string(),
                last_bid: None,
            },
        );
        true
    }

    /// Remove an instrument.
    pub fn remove(&mut self, id: SymbolId) -> Option<String> {
        self.by_id.remove(&id).map(|s| s.caller_name)
    }

    /// Whether an identifier is subscribed.
    #[must_use]
    pub fn contains(&self, id: SymbolId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Whether a caller-facing name is subscribed.
    #[must_use]
    pub fn contains_caller(&self, caller_name: &str) -> bool {
        self.by_id.values().any(|s| s.caller_name == caller_name)
    }

    /// Caller name for a subscribed identifier.
    #[must_use]
    pub fn caller_name(&self, id: SymbolId) -> Option<&str> {
        self.by_id.get(&id).map(|s| s.caller_name.as_str())
    }

    /// Subscribed caller names, sorted.
    #[must_use]
    pub fn caller_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_id.values().map(|s| s.caller_name.clone()).collect();
        names.sort();
        names
    }

    /// Number of subscribed instruments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Drop every subscription.
    pub fn clear(&mut self) {
        self.by_id.clear();
    }

    /// Apply a spot update and produce a tick if one can be formed.
    ///
    /// Returns `None` for instruments that are not subscribed and for
    /// updates that arrive before any bid is known.
    pub fn apply(&mut self, update: &SpotUpdate) -> Option<Tick> {
        let subscribed = self.by_id.get_mut(&update.symbol_id)?;

        if let Some(bid) = update.bid {
            subscribed.last_bid = Some(bid);
        }

        let bid = subscribed.last_bid?;

        Some(Tick {
            symbol: subscribed.caller_name.clone(),
            bid,
            ask: update.ask,
            timestamp: update.timestamp,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn update(id: SymbolId, bid: Option<i64>, ask: Option<i64>) -> SpotUpdate {
        SpotUpdate {
            symbol_id: id,
            bid: bid.map(|b| Decimal::new(b, 5)),
            ask: ask.map(|a| Decimal::new(a, 5)),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn insert_is_idempotent_per_id() {
        let mut subs = SpotSubscriptions::new();
        assert!(subs.insert(1, "EURUSD"));
        assert!(!subs.insert(1, "EURUSD"));
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn first_caller_name_wins_for_shared_id() {
        let mut subs = SpotSubscriptions::new();
        subs.insert(2, "NSXUSD");
        subs.insert(2, "USTEC");

        assert_eq!(subs.caller_name(2), Some("NSXUSD"));
        assert!(!subs.contains_caller("USTEC"));
    }

    #[test]
    fn tick_is_keyed_by_caller_name() {
        let mut subs = SpotSubscriptions::new();
        subs.insert(2, "NSXUSD");

        let tick = subs.apply(&update(2, Some(1_812_350_000), None)).unwrap();
        assert_eq!(tick.symbol, "NSXUSD");
        assert_eq!(tick.bid, Decimal::new(1_812_350_000, 5));
        assert!(tick.ask.is_none());
    }

    #[test]
    fn missing_bid_reuses_last_bid() {
        let mut subs = SpotSubscriptions::new();
        subs.insert(1, "EURUSD");

        subs.apply(&update(1, Some(110_000), Some(110_010))).unwrap();
        let tick = subs.apply(&update(1, None, Some(110_020))).unwrap();

        assert_eq!(tick.bid, Decimal::new(110_000, 5));
        assert_eq!(tick.ask, Some(Decimal::new(110_020, 5)));
    }

    #[test]
    fn ask_only_update_before_any_bid_is_dropped() {
        let mut subs = SpotSubscriptions::new();
        subs.insert(1, "EURUSD");

        assert!(subs.apply(&update(1, None, Some(110_020))).is_none());
    }

    #[test]
    fn unsubscribed_symbol_produces_no_tick() {
        let mut subs = SpotSubscriptions::new();
        assert!(subs.apply(&update(7, Some(1), Some(2))).is_none());
    }

    #[test]
    fn remove_and_clear() {
        let mut subs = SpotSubscriptions::new();
        subs.insert(1, "EURUSD");
        subs.insert(2, "GBPUSD");

        assert_eq!(subs.remove(1).as_deref(), Some("EURUSD"));
        assert!(!subs.contains(1));
        assert_eq!(subs.caller_names(), vec!["GBPUSD"]);

        subs.clear();
        assert!(subs.is_empty());
    }
}
