//! Dexfin Domain Layer
//!
//! Pure domain types with zero I/O dependencies.
//! Contains value objects, market data, order enums and instrument rules.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Public modules
pub mod credentials;
pub mod market_data;
pub mod orders;
pub mod symbols;
pub mod value_objects;

// Re-export commonly used types
pub use credentials::ApiCredentials;
pub use market_data::{BookLevel, OrderBookDiff, OrderBookSnapshot, TradeEvent};
pub use orders::{OrderState, OrderType};
pub use symbols::SymbolEntry;
pub use value_objects::{DomainError, OrderSide, Price, Quantity, TradingPair};
