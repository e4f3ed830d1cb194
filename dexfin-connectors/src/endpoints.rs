//! Exchange endpoints, URLs and wire constants.

use reqwest::Method;

use crate::error::{ConnectorError, ConnectorResult};
use crate::throttler::LimitId;

// =============================================================================
// Constants
// =============================================================================

/// Default REST base URL.
pub const REST_URL: &str = "https://trade.dexfin.com/api/v2/peatio";

/// Default streaming URL.
pub const WS_URL: &str = "wss://trade.dexfin.com/api/v2/ranger/public";

/// Default request timeout in milliseconds.
pub const REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Instrument catalog
pub const MARKETS_PATH: &str = "/public/markets";
/// 24h tickers for all markets
pub const TICKERS_PATH: &str = "/public/markets/tickers";
/// Order book snapshot (`{}` = exchange symbol)
pub const DEPTH_PATH: &str = "/public/markets/{}/depth";
/// Server time
pub const SERVER_TIME_PATH: &str = "/public/timestamp";
/// Liveness probe
pub const ALIVE_PATH: &str = "/public/health/alive";
/// Account balances
pub const BALANCES_PATH: &str = "/account/balances";
/// Place / list orders
pub const ORDERS_PATH: &str = "/market/orders";
/// Order detail (`{}` = order id)
pub const ORDER_DETAIL_PATH: &str = "/market/orders/{}";
/// Order cancel (`{}` = order id)
pub const ORDER_CANCEL_PATH: &str = "/market/orders/{}/cancel";
/// Own trade history
pub const TRADES_PATH: &str = "/market/trades";

/// Stream event type for incremental depth updates.
pub const DIFF_EVENT_TYPE: &str = "depthUpdate";
/// Stream event type for public trades.
pub const TRADE_EVENT_TYPE: &str = "trade";

/// Market `state` value that marks an instrument tradable.
pub const MARKET_STATE_ENABLED: &str = "enabled";

// =============================================================================
// Endpoint
// =============================================================================

/// A REST endpoint with its path parameters bound.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `GET /public/markets`
    Markets,
    /// `GET /public/markets/tickers`
    Tickers,
    /// `GET /public/markets/{symbol}/depth`
    Depth {
        /// Exchange symbol
        symbol: String,
    },
    /// `GET /public/timestamp`
    ServerTime,
    /// `GET /public/health/alive`
    Alive,
    /// `GET /account/balances`
    Balances,
    /// `GET /market/orders`
    ListOrders,
    /// `POST /market/orders`
    PlaceOrder,
    /// `GET /market/orders/{id}`
    OrderDetail {
        /// Exchange order id
        id: String,
    },
    /// `POST /market/orders/{id}/cancel`
    CancelOrder {
        /// Exchange order id
        id: String,
    },
    /// `GET /market/trades`
    Trades,
}

impl Endpoint {
    /// Path relative to the base URL. Parameters are percent-encoded.
    pub fn path(&self) -> String {
        match self {
            Endpoint::Markets => MARKETS_PATH.to_string(),
            Endpoint::Tickers => TICKERS_PATH.to_string(),
            Endpoint::Depth { symbol } => DEPTH_PATH.replace("{}", &urlencoding::encode(symbol)),
            Endpoint::ServerTime => SERVER_TIME_PATH.to_string(),
            Endpoint::Alive => ALIVE_PATH.to_string(),
            Endpoint::Balances => BALANCES_PATH.to_string(),
            Endpoint::ListOrders | Endpoint::PlaceOrder => ORDERS_PATH.to_string(),
            Endpoint::OrderDetail { id } => ORDER_DETAIL_PATH.replace("{}", &urlencoding::encode(id)),
            Endpoint::CancelOrder { id } => ORDER_CANCEL_PATH.replace("{}", &urlencoding::encode(id)),
            Endpoint::Trades => TRADES_PATH.to_string(),
        }
    }

    /// Reject path parameters that are empty or dot segments. URL
    /// normalization resolves those even when encoded.
    pub fn validate(&self) -> ConnectorResult<()> {
        let param = match self {
            Endpoint::Depth { symbol } => symbol,
            Endpoint::OrderDetail { id } | Endpoint::CancelOrder { id } => id,
            _ => return Ok(()),
        };
        match param.as_str() {
            "" | "." | ".." => Err(ConnectorError::Config(format!(
                "invalid path parameter {:?}",
                param
            ))),
            _ => Ok(()),
        }
    }

    /// HTTP method the exchange expects.
    pub fn default_method(&self) -> Method {
        match self {
            Endpoint::PlaceOrder | Endpoint::CancelOrder { .. } => Method::POST,
            _ => Method::GET,
        }
    }

    /// Whether the endpoint needs signed headers.
    pub fn is_private(&self) -> bool {
        matches!(
            self,
            Endpoint::Balances
                | Endpoint::ListOrders
                | Endpoint::PlaceOrder
                | Endpoint::OrderDetail { .. }
                | Endpoint::CancelOrder { .. }
                | Endpoint::Trades
        )
    }

    /// Rate-limit bucket charged for a call.
    pub fn limit_id(&self) -> LimitId {
        match self {
            Endpoint::Markets => LimitId::Markets,
            Endpoint::Tickers => LimitId::Tickers,
            Endpoint::Depth { .. } => LimitId::Depth,
            Endpoint::ServerTime => LimitId::ServerTime,
            Endpoint::Alive => LimitId::Alive,
            Endpoint::Balances => LimitId::Balances,
            Endpoint::ListOrders => LimitId::ListOrders,
            Endpoint::PlaceOrder => LimitId::PlaceOrder,
            Endpoint::OrderDetail { .. } => LimitId::OrderDetail,
            Endpoint::CancelOrder { .. } => LimitId::CancelOrder,
            Endpoint::Trades => LimitId::Trades,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_bind_parameters() {
        let depth = Endpoint::Depth { symbol: "btcusdt".to_string() };
        let cancel = Endpoint::CancelOrder { id: "42".to_string() };

        assert_eq!(depth.path(), "/public/markets/btcusdt/depth");
        assert_eq!(cancel.path(), "/market/orders/42/cancel");
        assert_eq!(Endpoint::OrderDetail { id: "7".to_string() }.path(), "/market/orders/7");
    }

    #[test]
    fn test_path_parameters_are_encoded() {
        let detail = Endpoint::OrderDetail { id: "1/../../account/balances".to_string() };
        let cancel = Endpoint::CancelOrder { id: "a b?x=1#f".to_string() };

        assert_eq!(detail.path(), "/market/orders/1%2F..%2F..%2Faccount%2Fbalances");
        assert_eq!(cancel.path(), "/market/orders/a%20b%3Fx%3D1%23f/cancel");
        assert!(detail.validate().is_ok());
    }

    #[test]
    fn test_dot_segments_are_rejected() {
        for bad in ["", ".", ".."] {
            let endpoint = Endpoint::OrderDetail { id: bad.to_string() };
            assert!(matches!(endpoint.validate(), Err(ConnectorError::Config(_))));
        }
        assert!(Endpoint::Depth { symbol: "..".to_string() }.validate().is_err());
        assert!(Endpoint::Markets.validate().is_ok());
    }

    #[test]
    fn test_methods_and_privacy() {
        assert_eq!(Endpoint::PlaceOrder.default_method(), Method::POST);
        assert_eq!(Endpoint::ListOrders.default_method(), Method::GET);
        assert!(Endpoint::Balances.is_private());
        assert!(!Endpoint::Markets.is_private());
        assert!(!Endpoint::ServerTime.is_private());
    }

    #[test]
    fn test_order_placement_has_own_limit() {
        assert_eq!(Endpoint::PlaceOrder.limit_id(), LimitId::PlaceOrder);
        assert_eq!(Endpoint::ListOrders.limit_id(), LimitId::ListOrders);
    }
}
