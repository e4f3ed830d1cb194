//! Dexfin Exchange Connector
//!
//! REST + WebSocket adapters for the Dexfin (Peatio) exchange.
//! Normalizes exchange-specific payloads to domain types.

#![warn(clippy::all)]

// Public modules
pub mod auth;
pub mod clock;
pub mod connector;
pub mod endpoints;
pub mod error;
pub mod order_book;
pub mod rest;
pub mod stream;
pub mod symbol_map;
pub mod throttler;

// Re-exports
pub use auth::{RequestSigner, SignedHeaders};
pub use clock::{ClockSynchronizer, LocalClock, SystemClock};
pub use connector::{Balance, DexfinConnector, OrderStatus};
pub use endpoints::Endpoint;
pub use error::{ConnectorError, ConnectorResult};
pub use order_book::{
    BookEvent, BookHandle, BookState, BookSync, BookSyncConfig, BookView, OrderBookSynchronizer,
    RestSnapshotSource, SnapshotSource,
};
pub use rest::{ConnectorConfig, RestClient, RestRequest};
pub use stream::{StreamError, StreamListener, StreamRouter};
pub use symbol_map::{MarketCatalog, SymbolMap};
pub use throttler::{
    apply_capacity_overrides, default_rate_limits, LimitId, RateLimit, RateLimitPermit, RateLimiter,
};
