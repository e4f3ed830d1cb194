//! Instrument catalog entries and their trading rules.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::{DomainError, TradingPair};

/// One tradable instrument as known to the connector.
///
/// Built from a catalog fetch and replaced wholesale on refresh; never mutated
/// in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolEntry {
    /// Engine-side identifier (`BTC-USDT`)
    pub internal_pair: TradingPair,
    /// Wire identifier (`btcusdt`)
    pub exchange_symbol: String,
    /// Minimum accepted price
    pub min_price: Decimal,
    /// Minimum order amount (base asset)
    pub min_amount: Decimal,
    /// Decimal places allowed in prices
    pub price_precision: u32,
    /// Decimal places allowed in amounts
    pub amount_precision: u32,
    /// Whether the market currently accepts orders
    pub enabled: bool,
}

impl SymbolEntry {
    /// Smallest price step, `10^-price_precision`.
    pub fn price_increment(&self) -> Decimal {
        Decimal::new(1, self.price_precision)
    }

    /// Smallest amount step, `10^-amount_precision`.
    pub fn amount_increment(&self) -> Decimal {
        Decimal::new(1, self.amount_precision)
    }

    /// Round a price down to the allowed precision.
    pub fn quantize_price(&self, price: Decimal) -> Decimal {
        price.round_dp_with_strategy(self.price_precision, RoundingStrategy::ToZero)
    }

    /// Round an amount down to the allowed precision.
    pub fn quantize_amount(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.amount_precision, RoundingStrategy::ToZero)
    }

    /// Check a (quantized) order against the instrument's minimums.
    ///
    /// # Errors
    /// `DomainError::TradingRuleViolation` if the market is disabled, the amount
    /// is below `min_amount`, or the price is below `min_price`.
    pub fn validate_order(&self, amount: Decimal, price: Option<Decimal>) -> Result<(), DomainError> {
        if !self.enabled {
            return Err(DomainError::TradingRuleViolation(format!(
                "{} is not enabled for trading",
                self.internal_pair
            )));
        }
        if amount < self.min_amount || amount.is_zero() {
            return Err(DomainError::TradingRuleViolation(format!(
                "amount {} below minimum {} for {}",
                amount, self.min_amount, self.internal_pair
            )));
        }
        if let Some(price) = price {
            if price < self.min_price || price.is_zero() {
                return Err(DomainError::TradingRuleViolation(format!(
                    "price {} below minimum {} for {}",
                    price, self.min_price, self.internal_pair
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry() -> SymbolEntry {
        SymbolEntry {
            internal_pair: TradingPair::new("DXF", "USDT").unwrap(),
            exchange_symbol: "dxfusdt".to_string(),
            min_price: dec!(0.001),
            min_amount: dec!(10.0),
            price_precision: 6,
            amount_precision: 3,
            enabled: true,
        }
    }

    #[test]
    fn test_increments_follow_precision() {
        let e = entry();

        assert_eq!(e.price_increment(), dec!(0.000001));
        assert_eq!(e.amount_increment(), dec!(0.001));
    }

    #[test]
    fn test_quantize_rounds_down() {
        let e = entry();

        assert_eq!(e.quantize_price(dec!(0.01828999)), dec!(0.018289));
        assert_eq!(e.quantize_amount(dec!(12.34567)), dec!(12.345));
    }

    #[test]
    fn test_validate_order_minimums() {
        let e = entry();

        assert!(e.validate_order(dec!(10), Some(dec!(0.02))).is_ok());
        assert!(e.validate_order(dec!(9.999), Some(dec!(0.02))).is_err());
        assert!(e.validate_order(dec!(10), Some(dec!(0.0001))).is_err());
        assert!(e.validate_order(dec!(10), None).is_ok());
    }

    #[test]
    fn test_disabled_market_rejects_orders() {
        let mut e = entry();
        e.enabled = false;

        assert!(matches!(
            e.validate_order(dec!(100), None),
            Err(DomainError::TradingRuleViolation(_))
        ));
    }
}
