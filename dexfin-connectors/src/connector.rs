//! Connector session: one clock, rate limiter, REST client and symbol map
//! shared by everything that talks to the exchange.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dexfin_domain::{
    ApiCredentials, DomainError, OrderSide, OrderState, OrderType, Price, Quantity, TradingPair,
};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::clock::ClockSynchronizer;
use crate::error::{ConnectorError, ConnectorResult};
use crate::order_book::{RestSnapshotSource, SnapshotSource};
use crate::rest::{ConnectorConfig, NewOrderRequest, OrderResponse, RestClient, TradeResponse};
use crate::symbol_map::SymbolMap;
use crate::throttler::{RateLimit, RateLimiter};

/// Available and locked amounts of one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balance {
    /// Free to trade
    pub available: Decimal,
    /// Reserved by open orders
    pub locked: Decimal,
}

impl Balance {
    pub fn total(&self) -> Decimal {
        self.available + self.locked
    }
}

/// Order as reported back to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderStatus {
    /// Exchange order id
    pub exchange_order_id: String,
    /// Instrument
    pub pair: TradingPair,
    /// Direction
    pub side: OrderSide,
    /// Limit or market
    pub order_type: OrderType,
    /// Mapped lifecycle state
    pub state: OrderState,
    /// Limit price
    pub price: Option<Decimal>,
    /// Original amount
    pub amount: Option<Decimal>,
    /// Filled amount
    pub executed_amount: Decimal,
    /// Average fill price
    pub average_price: Option<Decimal>,
}

impl OrderStatus {
    fn from_response(response: OrderResponse, pair: TradingPair) -> ConnectorResult<Self> {
        let order_type = match response.ord_type.as_deref() {
            Some(t) => t.parse()?,
            None => OrderType::Limit,
        };

        Ok(Self {
            exchange_order_id: response.id,
            pair,
            side: response.side.parse()?,
            order_type,
            state: OrderState::from_exchange(&response.state)?,
            price: response.price,
            amount: response.origin_volume,
            executed_amount: response.executed_volume.unwrap_or_default(),
            average_price: response.avg_price.filter(|p| !p.is_zero()),
        })
    }
}

/// Session against one exchange deployment.
#[derive(Debug)]
pub struct DexfinConnector {
    config: ConnectorConfig,
    clock: Arc<ClockSynchronizer>,
    rest: Arc<RestClient>,
    symbols: Arc<SymbolMap>,
}

impl DexfinConnector {
    /// Build a session. Without credentials only public calls succeed.
    ///
    /// # Errors
    /// `ConnectorError::RateLimit` for an invalid limit table, `Config` if the
    /// HTTP client cannot be built.
    pub fn new(
        config: ConnectorConfig,
        limits: Vec<RateLimit>,
        credentials: Option<ApiCredentials>,
    ) -> ConnectorResult<Self> {
        let clock = Arc::new(ClockSynchronizer::new());
        let limiter = Arc::new(RateLimiter::new(limits)?);
        let rest = Arc::new(RestClient::new(&config, limiter, clock.clone(), credentials)?);
        let symbols = Arc::new(SymbolMap::new(rest.clone()));

        Ok(Self {
            config,
            clock,
            rest,
            symbols,
        })
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<ClockSynchronizer> {
        &self.clock
    }

    pub fn rest(&self) -> &Arc<RestClient> {
        &self.rest
    }

    pub fn symbols(&self) -> &Arc<SymbolMap> {
        &self.symbols
    }

    /// Synchronize the clock and load the symbol map.
    ///
    /// A failed clock sync is logged and retried on the first private call.
    pub async fn start(&self) -> ConnectorResult<BTreeSet<TradingPair>> {
        match self.rest.sync_clock().await {
            Ok(offset_ms) => info!(offset_ms, "Clock synchronized"),
            Err(e) => warn!(error = %e, "Initial clock sync failed"),
        }

        let pairs = self.symbols.refresh().await?;
        info!(pairs = pairs.len(), "Connector started");
        Ok(pairs)
    }

    /// Resample the clock offset.
    pub async fn resync_clock(&self) -> ConnectorResult<i64> {
        self.rest.sync_clock().await
    }

    /// Liveness check against the health endpoint.
    pub async fn check_network(&self) -> ConnectorResult<()> {
        self.rest.alive().await
    }

    /// Snapshot source for order book synchronizers.
    pub fn order_book_source(&self) -> Arc<dyn SnapshotSource> {
        Arc::new(RestSnapshotSource::new(self.rest.clone(), self.symbols.clone()))
    }

    /// Invalidate the symbol map when the exchange says a market is gone.
    fn observe<T>(&self, result: ConnectorResult<T>) -> ConnectorResult<T> {
        if let Err(e) = &result {
            if e.is_unknown_market() {
                warn!(error = %e, "Exchange reported unknown market");
                self.symbols.invalidate();
            }
        }
        result
    }

    // =========================================================================
    // Market data
    // =========================================================================

    /// Last traded price for each requested pair that has a ticker.
    pub async fn last_traded_prices(
        &self,
        pairs: &[TradingPair],
    ) -> ConnectorResult<BTreeMap<TradingPair, Decimal>> {
        self.symbols.ensure_fresh().await?;
        let tickers = self.observe(self.rest.tickers().await)?;

        let mut prices = BTreeMap::new();
        for pair in pairs {
            let symbol = self.symbols.resolve(pair)?;
            if let Some(entry) = tickers.get(&symbol) {
                prices.insert(pair.clone(), entry.ticker.last);
            }
        }
        Ok(prices)
    }

    /// Mid price estimate (average price, falling back to last) for every
    /// known pair.
    pub async fn mid_prices(&self) -> ConnectorResult<BTreeMap<TradingPair, Decimal>> {
        self.symbols.ensure_fresh().await?;
        let tickers = self.observe(self.rest.tickers().await)?;

        Ok(tickers
            .into_iter()
            .filter_map(|(symbol, entry)| {
                let pair = self.symbols.reverse_resolve(&symbol).ok()?;
                let mid = entry
                    .ticker
                    .avg_price
                    .filter(|p| !p.is_zero())
                    .unwrap_or(entry.ticker.last);
                Some((pair, mid))
            })
            .collect())
    }

    // =========================================================================
    // Orders
    // =========================================================================

    /// Quantize, validate and submit an order.
    ///
    /// # Errors
    /// `ConnectorError::Domain` if the order breaks the pair's trading rules or
    /// a limit order has no price. `UnmappedOrder` (carrying the exchange id) if
    /// the order was accepted but its state or type is not recognized.
    pub async fn place_order(
        &self,
        pair: &TradingPair,
        side: OrderSide,
        order_type: OrderType,
        amount: Quantity,
        price: Option<Price>,
    ) -> ConnectorResult<OrderStatus> {
        self.symbols.ensure_fresh().await?;
        let rule = self.symbols.entry(pair)?;

        let amount = rule.quantize_amount(amount.as_decimal());
        let price = match order_type {
            OrderType::Limit => {
                let price = price.ok_or_else(|| {
                    DomainError::TradingRuleViolation("limit order requires a price".to_string())
                })?;
                Some(rule.quantize_price(price.as_decimal()))
            }
            OrderType::Market => None,
        };
        rule.validate_order(amount, price)?;

        let request = NewOrderRequest {
            market: rule.exchange_symbol.clone(),
            side: side.as_str().to_string(),
            volume: amount,
            ord_type: order_type.as_str().to_string(),
            price,
        };

        let response = self.observe(self.rest.place_order(&request).await)?;
        let exchange_order_id = response.id.clone();
        let status = OrderStatus::from_response(response, pair.clone()).map_err(|e| {
            warn!(
                pair = %pair,
                order_id = %exchange_order_id,
                error = %e,
                "Order accepted but response not mapped"
            );
            ConnectorError::UnmappedOrder {
                exchange_order_id,
                reason: e.to_string(),
            }
        })?;

        info!(
            pair = %pair,
            side = %side,
            amount = %amount,
            order_id = %status.exchange_order_id,
            state = %status.state,
            "Order placed"
        );
        Ok(status)
    }

    /// Cancel by exchange id.
    pub async fn cancel_order(&self, exchange_order_id: &str) -> ConnectorResult<OrderStatus> {
        let response = self.observe(self.rest.cancel_order(exchange_order_id).await)?;
        let pair = self.pair_of(&response).await?;
        info!(order_id = %exchange_order_id, pair = %pair, "Order cancel requested");
        OrderStatus::from_response(response, pair)
    }

    /// Current state of an order.
    pub async fn order_status(&self, exchange_order_id: &str) -> ConnectorResult<OrderStatus> {
        let response = self.observe(self.rest.order(exchange_order_id).await)?;
        let pair = self.pair_of(&response).await?;
        OrderStatus::from_response(response, pair)
    }

    /// Resting (`wait`) orders for a pair.
    pub async fn open_orders(&self, pair: &TradingPair) -> ConnectorResult<Vec<OrderStatus>> {
        let symbol = self.symbols.resolve_or_refresh(pair).await?;
        let orders = self.observe(self.rest.list_orders(&symbol, Some("wait")).await)?;

        orders
            .into_iter()
            .map(|o| OrderStatus::from_response(o, pair.clone()))
            .collect()
    }

    /// Own fills for a pair.
    pub async fn my_trades(&self, pair: &TradingPair) -> ConnectorResult<Vec<TradeResponse>> {
        let symbol = self.symbols.resolve_or_refresh(pair).await?;
        self.observe(self.rest.my_trades(&symbol).await)
    }

    /// Balances keyed by upper-case asset code.
    pub async fn balances(&self) -> ConnectorResult<BTreeMap<String, Balance>> {
        let rows = self.rest.balances().await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.currency.to_uppercase(),
                    Balance {
                        available: row.balance,
                        locked: row.locked,
                    },
                )
            })
            .collect())
    }

    async fn pair_of(&self, response: &OrderResponse) -> ConnectorResult<TradingPair> {
        match self.symbols.reverse_resolve(&response.market) {
            Ok(pair) => Ok(pair),
            Err(ConnectorError::UnknownSymbol(_)) => {
                self.symbols.refresh().await?;
                self.symbols.reverse_resolve(&response.market)
            }
            Err(e) => Err(e),
        }
    }
}
