//! Connector session against a mock exchange: symbol loading, order flow,
//! market data and symbol map invalidation.

use std::time::Duration;

use anyhow::Result;
use dexfin_connectors::{
    default_rate_limits, ConnectorConfig, ConnectorError, DexfinConnector, SnapshotSource,
};
use dexfin_domain::{
    ApiCredentials, DomainError, OrderSide, OrderState, OrderType, Price, Quantity, TradingPair,
};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn btc_usdt() -> TradingPair {
    TradingPair::new("BTC", "USDT").unwrap()
}

fn markets() -> Value {
    json!([
        {
            "id": "btcusdt",
            "name": "BTC/USDT",
            "base_unit": "btc",
            "quote_unit": "usdt",
            "min_price": "1.0",
            "min_amount": "0.001",
            "amount_precision": 4,
            "price_precision": 2,
            "state": "enabled"
        },
        {
            "id": "ethusdt",
            "name": "ETH/USDT",
            "base_unit": "eth",
            "quote_unit": "usdt",
            "min_price": "0.1",
            "min_amount": "0.01",
            "amount_precision": 3,
            "price_precision": 2,
            "state": "enabled"
        },
        {
            "id": "oldusdt",
            "name": "OLD/USDT",
            "base_unit": "old",
            "quote_unit": "usdt",
            "state": "disabled"
        }
    ])
}

fn order_json(id: Value, state: &str) -> Value {
    json!({
        "id": id,
        "side": "buy",
        "ord_type": "limit",
        "price": "30000.12",
        "avg_price": "0.0",
        "state": state,
        "market": "btcusdt",
        "created_at": "2024-01-05T10:00:00+01:00",
        "origin_volume": "0.1234",
        "remaining_volume": "0.1234",
        "executed_volume": "0.0",
        "trades_count": 0
    })
}

/// Mock server with the catalog and server time mounted.
async fn exchange() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/public/markets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(markets()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/public/timestamp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!("2024-01-05T10:00:00+00:00")))
        .mount(&server)
        .await;
    server
}

fn connector(server: &MockServer) -> Result<DexfinConnector> {
    let config = ConnectorConfig {
        rest_url: server.uri(),
        request_timeout: Duration::from_secs(2),
        ..ConnectorConfig::default()
    };
    Ok(DexfinConnector::new(
        config,
        default_rate_limits(),
        Some(ApiCredentials::new("key", "secret")),
    )?)
}

#[tokio::test]
async fn test_start_loads_enabled_pairs_and_syncs_clock() -> Result<()> {
    let server = exchange().await;
    let connector = connector(&server)?;

    let pairs = connector.start().await?;

    assert_eq!(pairs.len(), 2);
    assert!(pairs.contains(&btc_usdt()));
    assert!(connector.clock().has_sample());
    assert_eq!(connector.symbols().resolve(&btc_usdt())?, "btcusdt");
    assert!(connector
        .symbols()
        .resolve(&TradingPair::new("OLD", "USDT")?)
        .is_err());
    Ok(())
}

#[tokio::test]
async fn test_place_order_quantizes_before_submitting() -> Result<()> {
    let server = exchange().await;
    Mock::given(method("POST"))
        .and(path("/market/orders"))
        .and(body_partial_json(json!({
            "market": "btcusdt",
            "side": "buy",
            "ord_type": "limit",
            "volume": "0.1234",
            "price": "30000.12"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(order_json(json!(42), "wait")))
        .expect(1)
        .mount(&server)
        .await;

    let connector = connector(&server)?;
    connector.start().await?;

    let status = connector
        .place_order(
            &btc_usdt(),
            OrderSide::Buy,
            OrderType::Limit,
            Quantity::new(dec!(0.12345))?,
            Some(Price::new(dec!(30000.129))?),
        )
        .await?;

    assert_eq!(status.exchange_order_id, "42");
    assert_eq!(status.state, OrderState::Open);
    assert_eq!(status.pair, btc_usdt());
    assert_eq!(status.average_price, None);
    Ok(())
}

#[tokio::test]
async fn test_accepted_order_with_unknown_state_keeps_exchange_id() -> Result<()> {
    let server = exchange().await;
    Mock::given(method("POST"))
        .and(path("/market/orders"))
        .respond_with(ResponseTemplate::new(201).set_body_json(order_json(json!(777), "trigger_wait")))
        .expect(1)
        .mount(&server)
        .await;

    let connector = connector(&server)?;
    connector.start().await?;

    let err = connector
        .place_order(
            &btc_usdt(),
            OrderSide::Buy,
            OrderType::Limit,
            Quantity::new(dec!(0.1))?,
            Some(Price::new(dec!(30000))?),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectorError::UnmappedOrder { ref reason, .. } if reason.contains("trigger_wait")));
    assert_eq!(err.exchange_order_id(), Some("777"));
    Ok(())
}

#[tokio::test]
async fn test_order_below_minimum_is_rejected_locally() -> Result<()> {
    let server = exchange().await;
    Mock::given(method("POST"))
        .and(path("/market/orders"))
        .respond_with(ResponseTemplate::new(201).set_body_json(order_json(json!(1), "wait")))
        .expect(0)
        .mount(&server)
        .await;

    let connector = connector(&server)?;
    connector.start().await?;

    let result = connector
        .place_order(
            &btc_usdt(),
            OrderSide::Buy,
            OrderType::Limit,
            Quantity::new(dec!(0.0009))?,
            Some(Price::new(dec!(30000))?),
        )
        .await;

    assert!(matches!(
        result,
        Err(ConnectorError::Domain(DomainError::TradingRuleViolation(_)))
    ));
    Ok(())
}

#[tokio::test]
async fn test_limit_order_without_price_is_rejected() -> Result<()> {
    let server = exchange().await;
    let connector = connector(&server)?;
    connector.start().await?;

    let result = connector
        .place_order(
            &btc_usdt(),
            OrderSide::Sell,
            OrderType::Limit,
            Quantity::new(dec!(0.5))?,
            None,
        )
        .await;

    assert!(matches!(result, Err(ConnectorError::Domain(_))));
    Ok(())
}

#[tokio::test]
async fn test_cancel_and_status_map_order_state() -> Result<()> {
    let server = exchange().await;
    Mock::given(method("POST"))
        .and(path("/market/orders/42/cancel"))
        .respond_with(ResponseTemplate::new(201).set_body_json(order_json(json!(42), "cancel")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/market/orders/43"))
        .respond_with(ResponseTemplate::new(200).set_body_json(order_json(json!("43"), "done")))
        .mount(&server)
        .await;

    let connector = connector(&server)?;
    connector.start().await?;

    let cancelled = connector.cancel_order("42").await?;
    let filled = connector.order_status("43").await?;

    assert_eq!(cancelled.state, OrderState::Canceled);
    assert!(cancelled.state.is_terminal());
    assert_eq!(filled.state, OrderState::Filled);
    assert_eq!(filled.exchange_order_id, "43");
    Ok(())
}

#[tokio::test]
async fn test_open_orders_filters_on_wait_state() -> Result<()> {
    let server = exchange().await;
    Mock::given(method("GET"))
        .and(path("/market/orders"))
        .and(query_param("market", "btcusdt"))
        .and(query_param("state", "wait"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            order_json(json!(1), "wait"),
            order_json(json!(2), "wait")
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let connector = connector(&server)?;
    connector.start().await?;

    let orders = connector.open_orders(&btc_usdt()).await?;

    assert_eq!(orders.len(), 2);
    assert!(orders.iter().all(|o| o.state == OrderState::Open));
    Ok(())
}

#[tokio::test]
async fn test_unknown_market_error_invalidates_symbol_map() -> Result<()> {
    let server = exchange().await;
    Mock::given(method("GET"))
        .and(path("/market/orders/7"))
        .respond_with(
            ResponseTemplate::new(422).set_body_json(json!({"errors": ["market.market.doesnt_exist"]})),
        )
        .mount(&server)
        .await;

    let connector = connector(&server)?;
    connector.start().await?;
    assert!(!connector.symbols().needs_refresh());

    let err = connector.order_status("7").await.unwrap_err();

    assert!(err.is_unknown_market());
    assert!(connector.symbols().needs_refresh());

    // The next market call reloads the catalog
    connector.symbols().ensure_fresh().await?;
    assert!(!connector.symbols().needs_refresh());
    Ok(())
}

#[tokio::test]
async fn test_prices_from_tickers() -> Result<()> {
    let server = exchange().await;
    Mock::given(method("GET"))
        .and(path("/public/markets/tickers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "btcusdt": {"at": "1704448800", "ticker": {"last": "30000", "avg_price": "29950", "high": "30500", "low": "29000", "vol": "12"}},
            "ethusdt": {"at": "1704448800", "ticker": {"last": "2000", "avg_price": "0"}},
            "unlisted": {"at": "1704448800", "ticker": {"last": "1"}}
        })))
        .mount(&server)
        .await;

    let connector = connector(&server)?;
    connector.start().await?;
    let eth = TradingPair::new("ETH", "USDT")?;

    let last = connector.last_traded_prices(&[btc_usdt(), eth.clone()]).await?;
    let mid = connector.mid_prices().await?;

    assert_eq!(last.get(&btc_usdt()), Some(&dec!(30000)));
    assert_eq!(last.get(&eth), Some(&dec!(2000)));
    assert_eq!(mid.get(&btc_usdt()), Some(&dec!(29950)));
    assert_eq!(mid.get(&eth), Some(&dec!(2000)));
    assert_eq!(mid.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_balances_keyed_by_upper_case_asset() -> Result<()> {
    let server = exchange().await;
    Mock::given(method("GET"))
        .and(path("/account/balances"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"currency": "usdt", "balance": "250.5", "locked": "49.5"},
            {"currency": "btc", "balance": "0.01", "locked": "0"}
        ])))
        .mount(&server)
        .await;

    let connector = connector(&server)?;
    let balances = connector.balances().await?;

    assert_eq!(balances["USDT"].total(), dec!(300.0));
    assert_eq!(balances["BTC"].available, dec!(0.01));
    Ok(())
}

#[tokio::test]
async fn test_snapshot_source_builds_sorted_book() -> Result<()> {
    let server = exchange().await;
    Mock::given(method("GET"))
        .and(path("/public/markets/btcusdt/depth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "timestamp": 1704448800,
            "asks": [["30010", "0.5"], ["30005", "1.0"]],
            "bids": [["29990", "0.7"], ["29995", "0.2"]]
        })))
        .mount(&server)
        .await;

    let connector = connector(&server)?;
    connector.start().await?;
    let source = connector.order_book_source();

    let snapshot = source.fetch_snapshot(&btc_usdt()).await?;

    assert_eq!(snapshot.timestamp_ms, 1_704_448_800_000);
    assert_eq!(snapshot.sequence_id, 0);
    assert_eq!(snapshot.best_bid(), Some(dec!(29995)));
    assert_eq!(snapshot.best_ask(), Some(dec!(30005)));
    Ok(())
}
