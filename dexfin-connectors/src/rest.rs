//! Dexfin REST API client.
//!
//! Provides the request pipeline used by every other component:
//! - Rate limiting per endpoint (see [`crate::throttler`])
//! - Clock synchronization before the first private call
//! - Signed headers for private endpoints (see [`crate::auth`])
//! - Error classification of non-2xx responses
//!
//! # Error classification
//!
//! | Response | Error |
//! |---|---|
//! | `{"code": .., "message"|"msg": ..}` or `{"errors": [..]}` | `Exchange` |
//! | HTTP 401, or a code in the `authz.` namespace | `Authentication` |
//! | anything else | `Transport { status, body }` |
//!
//! Nothing is retried here; retry policy belongs to the caller.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use dexfin_domain::ApiCredentials;
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::auth::{RequestSigner, SignedHeaders};
use crate::clock::ClockSynchronizer;
use crate::endpoints::{Endpoint, REQUEST_TIMEOUT_MS, REST_URL, WS_URL};
use crate::error::{ConnectorError, ConnectorResult};
use crate::throttler::RateLimiter;

// =============================================================================
// Configuration
// =============================================================================

/// Connection settings shared by the REST client and the stream listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    /// REST base URL (no trailing slash)
    pub rest_url: String,
    /// Streaming URL
    pub ws_url: String,
    /// Default per-request timeout
    pub request_timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            rest_url: REST_URL.to_string(),
            ws_url: WS_URL.to_string(),
            request_timeout: Duration::from_millis(REQUEST_TIMEOUT_MS),
        }
    }
}

// =============================================================================
// Request
// =============================================================================

/// One REST call.
#[derive(Debug, Clone)]
pub struct RestRequest {
    /// Target endpoint
    pub endpoint: Endpoint,
    /// HTTP method (defaults to the endpoint's)
    pub method: Method,
    /// Query parameters
    pub query: Vec<(String, String)>,
    /// JSON body
    pub body: Option<Value>,
    /// Attach signed headers (defaults to the endpoint's privacy)
    pub auth_required: bool,
    /// Overrides the client's default timeout
    pub timeout: Option<Duration>,
}

impl RestRequest {
    /// Request with the endpoint's default method and auth requirement.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            method: endpoint.default_method(),
            auth_required: endpoint.is_private(),
            endpoint,
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// Add a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Set the JSON body.
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Override the HTTP method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Override whether the request is signed.
    pub fn auth(mut self, required: bool) -> Self {
        self.auth_required = required;
        self
    }

    /// Override the timeout for this call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// =============================================================================
// Client
// =============================================================================

/// Rate-limited, optionally authenticated REST client.
pub struct RestClient {
    http: Client,
    base_url: String,
    default_timeout: Duration,
    limiter: Arc<RateLimiter>,
    clock: Arc<ClockSynchronizer>,
    signer: Option<RequestSigner>,
}

impl RestClient {
    /// Create a client. Without credentials only public endpoints work.
    ///
    /// # Errors
    /// `ConnectorError::Config` if the HTTP client cannot be built.
    pub fn new(
        config: &ConnectorConfig,
        limiter: Arc<RateLimiter>,
        clock: Arc<ClockSynchronizer>,
        credentials: Option<ApiCredentials>,
    ) -> ConnectorResult<Self> {
        let http = Client::builder()
            .build()
            .map_err(|e| ConnectorError::Config(format!("HTTP client: {}", e)))?;

        let signer = credentials
            .filter(ApiCredentials::is_complete)
            .map(|c| RequestSigner::new(c, clock.clone()));

        Ok(Self {
            http,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            default_timeout: config.request_timeout,
            limiter,
            clock,
            signer,
        })
    }

    /// Shared clock.
    pub fn clock(&self) -> &Arc<ClockSynchronizer> {
        &self.clock
    }

    /// Whether private endpoints can be called.
    pub fn has_credentials(&self) -> bool {
        self.signer.is_some()
    }

    /// Execute a request and return the parsed body (`null` for an empty body).
    pub async fn call(&self, request: RestRequest) -> ConnectorResult<Value> {
        request.endpoint.validate()?;
        let _permit = self.limiter.acquire(request.endpoint.limit_id()).await?;

        let headers = if request.auth_required {
            let signer = self.signer.as_ref().ok_or_else(|| {
                ConnectorError::Config(format!(
                    "credentials required for {}",
                    request.endpoint.path()
                ))
            })?;
            if !self.clock.has_sample() {
                // Without a sample the nonce falls back to local time
                if let Err(e) = self.sync_clock().await {
                    warn!(error = %e, "Clock sync failed, signing with local time");
                }
            }
            Some(signer.headers()?)
        } else {
            None
        };

        self.dispatch(&request, headers).await
    }

    /// Fetch server time and record a clock sample against the round-trip midpoint.
    ///
    /// Returns the new offset in milliseconds.
    pub async fn sync_clock(&self) -> ConnectorResult<i64> {
        let request = RestRequest::new(Endpoint::ServerTime);
        let _permit = self.limiter.acquire(request.endpoint.limit_id()).await?;

        let before = self.clock.local_time_ms();
        let body = self.dispatch(&request, None).await?;
        let after = self.clock.local_time_ms();

        let server_ms = parse_server_time(&body)?;
        self.clock.record_sample(server_ms, before + (after - before) / 2);

        Ok(self.clock.offset_ms())
    }

    async fn dispatch(
        &self,
        request: &RestRequest,
        headers: Option<SignedHeaders>,
    ) -> ConnectorResult<Value> {
        let path = request.endpoint.path();
        let url = format!("{}{}", self.base_url, path);

        let mut builder = self.http.request(request.method.clone(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(headers) = &headers {
            for (name, value) in headers.pairs() {
                builder = builder.header(name, value);
            }
        }

        let limit = request.timeout.unwrap_or(self.default_timeout);
        debug!(method = %request.method, path = %path, "REST request");

        // One deadline covers both the response head and the body
        let (status, body) = timeout(limit, async {
            let response = builder
                .send()
                .await
                .map_err(|e| ConnectorError::transport(e.status().map(|s| s.as_u16()), e.to_string()))?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| ConnectorError::transport(Some(status.as_u16()), e.to_string()))?;
            Ok::<_, ConnectorError>((status, body))
        })
        .await
        .map_err(|_| ConnectorError::transport(None, format!("{} timed out after {:?}", path, limit)))??;

        if !status.is_success() {
            let error = classify_error(status.as_u16(), &body);
            warn!(path = %path, status = status.as_u16(), error = %error, "REST request failed");
            return Err(error);
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| ConnectorError::Parse(format!("{}: {}", path, e)))
    }

    async fn call_typed<T: DeserializeOwned>(&self, request: RestRequest) -> ConnectorResult<T> {
        let path = request.endpoint.path();
        let value = self.call(request).await?;
        serde_json::from_value(value).map_err(|e| ConnectorError::Parse(format!("{}: {}", path, e)))
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Instrument catalog.
    ///
    /// # Endpoint
    ///
    /// `GET /public/markets`
    pub async fn markets(&self) -> ConnectorResult<Vec<MarketInfo>> {
        self.call_typed(RestRequest::new(Endpoint::Markets)).await
    }

    /// 24h tickers keyed by exchange symbol.
    pub async fn tickers(&self) -> ConnectorResult<BTreeMap<String, TickerEntry>> {
        self.call_typed(RestRequest::new(Endpoint::Tickers)).await
    }

    /// Order book snapshot for an exchange symbol.
    ///
    /// # Endpoint
    ///
    /// `GET /public/markets/{symbol}/depth`
    pub async fn depth(&self, symbol: &str) -> ConnectorResult<DepthResponse> {
        self.call_typed(RestRequest::new(Endpoint::Depth {
            symbol: symbol.to_string(),
        }))
        .await
    }

    /// Exchange time in milliseconds.
    pub async fn server_time(&self) -> ConnectorResult<i64> {
        let body = self.call(RestRequest::new(Endpoint::ServerTime)).await?;
        parse_server_time(&body)
    }

    /// Liveness probe.
    pub async fn alive(&self) -> ConnectorResult<()> {
        self.call(RestRequest::new(Endpoint::Alive)).await.map(|_| ())
    }

    // =========================================================================
    // Private API
    // =========================================================================

    /// Account balances.
    pub async fn balances(&self) -> ConnectorResult<Vec<BalanceEntry>> {
        self.call_typed(RestRequest::new(Endpoint::Balances)).await
    }

    /// Submit an order.
    ///
    /// # Endpoint
    ///
    /// `POST /market/orders`
    pub async fn place_order(&self, order: &NewOrderRequest) -> ConnectorResult<OrderResponse> {
        let body = serde_json::to_value(order).map_err(|e| ConnectorError::Parse(e.to_string()))?;
        self.call_typed(RestRequest::new(Endpoint::PlaceOrder).json(body)).await
    }

    /// Orders for a market, optionally filtered by wire state (`wait`, `done`, ...).
    pub async fn list_orders(
        &self,
        market: &str,
        state: Option<&str>,
    ) -> ConnectorResult<Vec<OrderResponse>> {
        let mut request = RestRequest::new(Endpoint::ListOrders).query("market", market);
        if let Some(state) = state {
            request = request.query("state", state);
        }
        self.call_typed(request).await
    }

    /// Order detail by exchange id.
    pub async fn order(&self, id: &str) -> ConnectorResult<OrderResponse> {
        self.call_typed(RestRequest::new(Endpoint::OrderDetail { id: id.to_string() }))
            .await
    }

    /// Cancel an order by exchange id.
    pub async fn cancel_order(&self, id: &str) -> ConnectorResult<OrderResponse> {
        self.call_typed(RestRequest::new(Endpoint::CancelOrder { id: id.to_string() }))
            .await
    }

    /// Own trade history for a market.
    pub async fn my_trades(&self, market: &str) -> ConnectorResult<Vec<TradeResponse>> {
        self.call_typed(RestRequest::new(Endpoint::Trades).query("market", market))
            .await
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Response handling
// =============================================================================

/// Map a non-2xx response to an error.
pub fn classify_error(status: u16, body: &str) -> ConnectorError {
    let payload = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| error_payload(&v));

    match payload {
        Some((code, message)) if status == 401 || code.starts_with("authz.") => {
            ConnectorError::Authentication { code, message }
        }
        Some((code, message)) => ConnectorError::Exchange { code, message },
        None if status == 401 => ConnectorError::Authentication {
            code: status.to_string(),
            message: body.to_string(),
        },
        None => ConnectorError::transport(Some(status), body),
    }
}

fn error_payload(value: &Value) -> Option<(String, String)> {
    if let Some(code) = value.get("code") {
        let code = match code {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let message = value
            .get("message")
            .or_else(|| value.get("msg"))
            .and_then(Value::as_str)?;
        return Some((code, message.to_string()));
    }

    // Peatio envelope: {"errors": ["market.order.invalid_volume", ...]}
    let errors = value.get("errors")?.as_array()?;
    let code = errors.first()?.as_str()?.to_string();
    let message = errors
        .iter()
        .filter_map(Value::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    Some((code, message))
}

/// Parse `/public/timestamp`: an ISO-8601 string or integer seconds.
pub fn parse_server_time(body: &Value) -> ConnectorResult<i64> {
    match body {
        Value::String(s) => {
            if let Ok(secs) = s.trim().parse::<i64>() {
                return Ok(secs * 1000);
            }
            DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| dt.timestamp_millis())
                .map_err(|e| ConnectorError::Parse(format!("server time {:?}: {}", s, e)))
        }
        Value::Number(n) => n
            .as_i64()
            .map(|secs| secs * 1000)
            .or_else(|| n.as_f64().map(|secs| (secs * 1000.0) as i64))
            .ok_or_else(|| ConnectorError::Parse(format!("server time {}", n))),
        other => Err(ConnectorError::Parse(format!("server time {}", other))),
    }
}

// =============================================================================
// Response types
// =============================================================================

/// Catalog entry from `/public/markets`.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketInfo {
    /// Exchange symbol (`btcusdt`)
    pub id: String,
    /// Display name (`BTC/USDT`)
    #[serde(default)]
    pub name: String,
    /// Base asset (`btc`)
    pub base_unit: String,
    /// Quote asset (`usdt`)
    pub quote_unit: String,
    /// Minimum price
    #[serde(default)]
    pub min_price: Decimal,
    /// Minimum amount
    #[serde(default)]
    pub min_amount: Decimal,
    /// Amount decimal places
    #[serde(default)]
    pub amount_precision: u32,
    /// Price decimal places
    #[serde(default)]
    pub price_precision: u32,
    /// `enabled`, `disabled`, ...
    #[serde(default)]
    pub state: Option<String>,
}

/// Per-market entry from `/public/markets/tickers`.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerEntry {
    /// Server time of the ticker
    #[serde(default)]
    pub at: Option<Value>,
    /// Ticker body
    pub ticker: Ticker,
}

/// 24h ticker values.
#[derive(Debug, Clone, Deserialize)]
pub struct Ticker {
    /// Last traded price
    pub last: Decimal,
    /// Average price
    #[serde(default)]
    pub avg_price: Option<Decimal>,
    /// 24h low
    #[serde(default)]
    pub low: Option<Decimal>,
    /// 24h high
    #[serde(default)]
    pub high: Option<Decimal>,
    /// 24h volume
    #[serde(default)]
    pub volume: Option<Decimal>,
}

/// Depth snapshot from `/public/markets/{symbol}/depth`.
#[derive(Debug, Clone, Deserialize)]
pub struct DepthResponse {
    /// Server time in seconds
    #[serde(default)]
    pub timestamp: i64,
    /// Bid levels `[price, size]`
    #[serde(default)]
    pub bids: Vec<(Decimal, Decimal)>,
    /// Ask levels `[price, size]`
    #[serde(default)]
    pub asks: Vec<(Decimal, Decimal)>,
    /// Book sequence, when the exchange provides one
    #[serde(default, alias = "lastUpdateId")]
    pub sequence: Option<u64>,
}

/// Balance row from `/account/balances`.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceEntry {
    /// Asset code (`usdt`)
    pub currency: String,
    /// Available balance
    pub balance: Decimal,
    /// Balance locked in open orders
    #[serde(default)]
    pub locked: Decimal,
}

/// Body of `POST /market/orders`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NewOrderRequest {
    /// Exchange symbol
    pub market: String,
    /// `buy` or `sell`
    pub side: String,
    /// Amount in base asset
    pub volume: Decimal,
    /// `limit` or `market`
    pub ord_type: String,
    /// Limit price
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
}

/// Order as returned by the order endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    /// Exchange order id
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// `buy` or `sell`
    pub side: String,
    /// `limit` or `market`
    #[serde(default)]
    pub ord_type: Option<String>,
    /// Limit price
    #[serde(default)]
    pub price: Option<Decimal>,
    /// Average fill price
    #[serde(default)]
    pub avg_price: Option<Decimal>,
    /// Wire state (`wait`, `done`, ...)
    pub state: String,
    /// Exchange symbol
    pub market: String,
    /// Creation time (ISO-8601)
    #[serde(default)]
    pub created_at: Option<String>,
    /// Original amount
    #[serde(default)]
    pub origin_volume: Option<Decimal>,
    /// Unfilled amount
    #[serde(default)]
    pub remaining_volume: Option<Decimal>,
    /// Filled amount
    #[serde(default)]
    pub executed_volume: Option<Decimal>,
    /// Fills, when included
    #[serde(default)]
    pub trades: Vec<TradeResponse>,
}

/// Own trade row.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeResponse {
    /// Trade id
    pub id: u64,
    /// Fill price
    pub price: Decimal,
    /// Fill amount
    pub amount: Decimal,
    /// Quote total
    #[serde(default)]
    pub total: Option<Decimal>,
    /// Exchange symbol
    pub market: String,
    /// Execution time (ISO-8601)
    #[serde(default)]
    pub created_at: Option<String>,
    /// Our side
    #[serde(default)]
    pub side: Option<String>,
    /// Taker side
    #[serde(default)]
    pub taker_type: Option<String>,
    /// Order the fill belongs to
    #[serde(default)]
    pub order_id: Option<u64>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_code_and_message_is_exchange_error() {
        let err = classify_error(422, r#"{"code": "market.order.invalid_volume", "message": "too small"}"#);

        assert!(matches!(
            err,
            ConnectorError::Exchange { ref code, ref message }
                if code == "market.order.invalid_volume" && message == "too small"
        ));
    }

    #[test]
    fn test_msg_alias_and_numeric_code() {
        let err = classify_error(400, r#"{"code": -1121, "msg": "Invalid symbol."}"#);

        assert!(matches!(err, ConnectorError::Exchange { ref code, .. } if code == "-1121"));
    }

    #[test]
    fn test_peatio_errors_envelope() {
        let err = classify_error(422, r#"{"errors": ["market.market.doesnt_exist"]}"#);

        assert!(err.is_unknown_market());
    }

    #[test]
    fn test_authz_code_is_authentication_error() {
        let err = classify_error(400, r#"{"errors": ["authz.invalid_signature"]}"#);

        assert!(matches!(err, ConnectorError::Authentication { ref code, .. } if code == "authz.invalid_signature"));
    }

    #[test]
    fn test_401_without_payload_is_authentication_error() {
        let err = classify_error(401, "Unauthorized");

        assert!(matches!(err, ConnectorError::Authentication { .. }));
    }

    #[test]
    fn test_400_without_code_is_transport_error() {
        let err = classify_error(400, "bad");

        assert!(matches!(
            err,
            ConnectorError::Transport { status: Some(400), ref body } if body == "bad"
        ));
    }

    #[test]
    fn test_parse_server_time_formats() {
        assert_eq!(parse_server_time(&json!("2019-05-02T09:55:37+00:00")).unwrap(), 1_556_790_937_000);
        assert_eq!(parse_server_time(&json!("2019-05-02T09:55:37Z")).unwrap(), 1_556_790_937_000);
        assert_eq!(parse_server_time(&json!(1_656_483_612)).unwrap(), 1_656_483_612_000);
        assert_eq!(parse_server_time(&json!("1656483612")).unwrap(), 1_656_483_612_000);
        assert!(parse_server_time(&json!({"t": 1})).is_err());
    }

    #[test]
    fn test_request_defaults_follow_endpoint() {
        let public = RestRequest::new(Endpoint::Markets);
        let private = RestRequest::new(Endpoint::PlaceOrder);

        assert_eq!(public.method, Method::GET);
        assert!(!public.auth_required);
        assert_eq!(private.method, Method::POST);
        assert!(private.auth_required);
    }

    #[test]
    fn test_new_order_body_shape() {
        let order = NewOrderRequest {
            market: "btcusdt".to_string(),
            side: "sell".to_string(),
            volume: dec!(0.15),
            ord_type: "limit".to_string(),
            price: Some(dec!(3)),
        };

        let body = serde_json::to_value(&order).unwrap();

        assert_eq!(body["market"], "btcusdt");
        assert_eq!(body["ord_type"], "limit");
        assert!(body.get("price").is_some());
    }

    #[test]
    fn test_order_response_accepts_numeric_id() {
        let order: OrderResponse = serde_json::from_value(json!({
            "id": 1204442,
            "side": "sell",
            "ord_type": "limit",
            "price": "56632.793",
            "state": "done",
            "market": "btcusdt"
        }))
        .unwrap();

        assert_eq!(order.id, "1204442");
        assert_eq!(order.price, Some(dec!(56632.793)));
    }
}
