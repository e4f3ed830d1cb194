//! Value Objects for the Dexfin Domain
//!
//! Immutable, validated domain primitives.
//! All value objects enforce invariants at construction time.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Domain errors for value object validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// Price must be positive
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    /// Quantity must be positive
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Trading pair must be `BASE-QUOTE`
    #[error("Invalid trading pair: {0}")]
    InvalidTradingPair(String),

    /// Order side not recognized
    #[error("Invalid order side: {0}")]
    InvalidOrderSide(String),

    /// Order type not recognized
    #[error("Invalid order type: {0}")]
    InvalidOrderType(String),

    /// Order state string not in the exchange's state table
    #[error("Unknown order state: {0}")]
    UnknownOrderState(String),

    /// Order violates the instrument's trading rule
    #[error("Trading rule violation: {0}")]
    TradingRuleViolation(String),
}

// =============================================================================
// Price
// =============================================================================

/// Price represents a positive decimal price
///
/// # Invariants
/// - Must be > 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Price(Decimal);

impl Price {
    /// Create a new Price with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPrice` if value <= 0
    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value <= Decimal::ZERO {
            return Err(DomainError::InvalidPrice("Price must be positive".to_string()));
        }
        Ok(Self(value))
    }

    /// Get the underlying Decimal value
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Quantity
// =============================================================================

/// Quantity represents a positive decimal quantity
///
/// # Invariants
/// - Must be > 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Quantity(Decimal);

impl Quantity {
    /// Create a new Quantity with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidQuantity` if value <= 0
    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value <= Decimal::ZERO {
            return Err(DomainError::InvalidQuantity("Quantity must be positive".to_string()));
        }
        Ok(Self(value))
    }

    /// Get the underlying Decimal value
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// TradingPair
// =============================================================================

/// Internal instrument identifier used by the calling engine (e.g., `BTC-USDT`).
///
/// The exchange uses its own symbol form on the wire (`btcusdt`); the two are
/// linked only through the connector's symbol map.
///
/// # Invariants
/// - Base and quote are non-empty, alphanumeric, stored upper case
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TradingPair {
    base: String,
    quote: String,
}

impl TradingPair {
    /// Create a pair from explicit base and quote assets.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidTradingPair` if either side is empty or
    /// contains anything other than ASCII alphanumerics.
    pub fn new(base: &str, quote: &str) -> Result<Self, DomainError> {
        let valid = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric());
        if !valid(base) || !valid(quote) {
            return Err(DomainError::InvalidTradingPair(format!("{}-{}", base, quote)));
        }
        Ok(Self {
            base: base.to_ascii_uppercase(),
            quote: quote.to_ascii_uppercase(),
        })
    }

    /// Get the base asset
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Get the quote asset
    pub fn quote(&self) -> &str {
        &self.quote
    }
}

impl FromStr for TradingPair {
    type Err = DomainError;

    /// Parse `BASE-QUOTE` (case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('-') {
            Some((base, quote)) => Self::new(base, quote),
            None => Err(DomainError::InvalidTradingPair(s.to_string())),
        }
    }
}

impl TryFrom<String> for TradingPair {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TradingPair> for String {
    fn from(pair: TradingPair) -> Self {
        pair.to_string()
    }
}

impl fmt::Display for TradingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}

// =============================================================================
// OrderSide
// =============================================================================

/// OrderSide represents the order (or trade taker) direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    /// Buy order
    Buy,
    /// Sell order
    Sell,
}

impl OrderSide {
    /// Wire representation used by the exchange.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl FromStr for OrderSide {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" | "bid" => Ok(OrderSide::Buy),
            "sell" | "ask" => Ok(OrderSide::Sell),
            other => Err(DomainError::InvalidOrderSide(other.to_string())),
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_must_be_positive() {
        assert!(Price::new(dec!(0.01)).is_ok());
        assert!(Price::new(Decimal::ZERO).is_err());
        assert!(Price::new(dec!(-1)).is_err());
    }

    #[test]
    fn test_quantity_must_be_positive() {
        assert_eq!(Quantity::new(dec!(2.5)).unwrap().as_decimal(), dec!(2.5));
        assert!(matches!(
            Quantity::new(Decimal::ZERO),
            Err(DomainError::InvalidQuantity(_))
        ));
    }

    #[test]
    fn test_trading_pair_parse_normalizes_case() {
        let pair: TradingPair = "btc-usdt".parse().unwrap();

        assert_eq!(pair.base(), "BTC");
        assert_eq!(pair.quote(), "USDT");
        assert_eq!(pair.to_string(), "BTC-USDT");
        assert_eq!(pair, "BTC-USDT".parse().unwrap());
    }

    #[test]
    fn test_trading_pair_rejects_malformed() {
        assert!("BTCUSDT".parse::<TradingPair>().is_err());
        assert!("-USDT".parse::<TradingPair>().is_err());
        assert!("BTC-".parse::<TradingPair>().is_err());
        assert!("BTC-US/DT".parse::<TradingPair>().is_err());
    }

    #[test]
    fn test_trading_pair_serde_as_string() {
        let pair = TradingPair::new("dxf", "usdt").unwrap();
        let json = serde_json::to_string(&pair).unwrap();

        assert_eq!(json, "\"DXF-USDT\"");
        assert_eq!(serde_json::from_str::<TradingPair>(&json).unwrap(), pair);
    }

    #[test]
    fn test_order_side_wire_format() {
        assert_eq!(OrderSide::Buy.as_str(), "buy");
        assert_eq!("SELL".parse::<OrderSide>().unwrap(), OrderSide::Sell);
        assert_eq!("bid".parse::<OrderSide>().unwrap(), OrderSide::Buy);
        assert!("hold".parse::<OrderSide>().is_err());
    }
}
