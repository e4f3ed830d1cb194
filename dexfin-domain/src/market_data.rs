//! Market Data Types
//!
//! Canonical order book and trade types shared by the connector and its callers.
//! Prices and sizes stay as `Decimal` end to end; the exchange sends them as strings.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{OrderSide, TradingPair};

// =============================================================================
// Book Level
// =============================================================================

/// One price level: aggregated size resting at a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    /// Level price
    pub price: Decimal,
    /// Aggregated size (0 in a diff means "remove")
    pub size: Decimal,
}

impl BookLevel {
    /// Create a new level.
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }

    /// Whether this level (as an update) removes the price.
    pub fn is_removal(&self) -> bool {
        self.size.is_zero()
    }
}

impl From<(Decimal, Decimal)> for BookLevel {
    fn from((price, size): (Decimal, Decimal)) -> Self {
        Self { price, size }
    }
}

// =============================================================================
// Order Book Snapshot
// =============================================================================

/// Full point-in-time state of one instrument's order book.
///
/// # Invariants
/// - `bids` strictly descending by price, `asks` strictly ascending
/// - No zero-size levels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    /// Instrument
    pub pair: TradingPair,
    /// Exchange timestamp of the snapshot (ms since epoch)
    pub timestamp_ms: i64,
    /// Sequence the snapshot reflects (0 when the exchange did not send one)
    pub sequence_id: u64,
    /// Bid levels, best first
    pub bids: Vec<BookLevel>,
    /// Ask levels, best first
    pub asks: Vec<BookLevel>,
}

impl OrderBookSnapshot {
    /// Build a snapshot from unordered levels.
    ///
    /// Sorts each side, collapses duplicate prices (last one wins) and drops
    /// zero-size levels so the invariants hold regardless of input order.
    pub fn from_levels(
        pair: TradingPair,
        timestamp_ms: i64,
        sequence_id: u64,
        bids: impl IntoIterator<Item = BookLevel>,
        asks: impl IntoIterator<Item = BookLevel>,
    ) -> Self {
        let mut bids = collapse(bids);
        bids.reverse();
        let asks = collapse(asks);

        Self {
            pair,
            timestamp_ms,
            sequence_id,
            bids,
            asks,
        }
    }

    /// Get the best bid price (highest bid).
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|level| level.price)
    }

    /// Get the best ask price (lowest ask).
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|level| level.price)
    }

    /// Get the midpoint price (best bid + best ask) / 2.
    pub fn midpoint(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            _ => None,
        }
    }

    /// Get the spread (best ask - best bid).
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Whether both sides are empty.
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// New snapshot with a diff folded in. The result carries the diff's
    /// `sequence_end` and timestamp.
    pub fn with_diff(&self, diff: &OrderBookDiff) -> Self {
        Self::from_levels(
            self.pair.clone(),
            diff.timestamp_ms,
            diff.sequence_end,
            self.bids.iter().chain(diff.bid_updates.iter()).copied(),
            self.asks.iter().chain(diff.ask_updates.iter()).copied(),
        )
    }
}

/// Sort ascending by price, last duplicate wins, zero sizes dropped.
fn collapse(levels: impl IntoIterator<Item = BookLevel>) -> Vec<BookLevel> {
    let mut side = BTreeMap::new();
    for level in levels {
        side.insert(level.price, level.size);
    }
    side.into_iter()
        .filter(|(_, size)| !size.is_zero())
        .map(|(price, size)| BookLevel::new(price, size))
        .collect()
}

// =============================================================================
// Order Book Diff
// =============================================================================

/// Incremental update covering sequences `sequence_start..=sequence_end`.
///
/// Sizes are absolute: an update replaces the level, a zero size removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookDiff {
    /// Instrument
    pub pair: TradingPair,
    /// First sequence covered
    pub sequence_start: u64,
    /// Last sequence covered
    pub sequence_end: u64,
    /// Exchange event time (ms since epoch)
    pub timestamp_ms: i64,
    /// Bid level updates
    pub bid_updates: Vec<BookLevel>,
    /// Ask level updates
    pub ask_updates: Vec<BookLevel>,
}

// =============================================================================
// Trade Event
// =============================================================================

/// A public trade print.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Instrument
    pub pair: TradingPair,
    /// Exchange trade id
    pub trade_id: u64,
    /// Execution price
    pub price: Decimal,
    /// Executed amount (base asset)
    pub amount: Decimal,
    /// Taker side
    pub side: OrderSide,
    /// Trade time (ms since epoch)
    pub timestamp_ms: i64,
}

// =============================================================================
// Tests
// =============================================================================
