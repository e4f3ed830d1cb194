//! Dexfin market-data stream listener.
//!
//! One WebSocket connection carries the `trade` and `depth` channels of every
//! configured instrument. Messages are demultiplexed on the event-type field:
//! - `trade` → the shared trade sink
//! - `depthUpdate` → the instrument's book queue as [`BookEvent::Diff`]
//! - ping / pong frames → [`BookEvent::Heartbeat`] on every book queue
//!
//! Connection loss, close frames and read timeouts end [`StreamListener::run`]
//! with an error; reconnecting is the caller's decision.

use std::collections::HashMap;
use std::time::Duration;

use dexfin_domain::{BookLevel, OrderBookDiff, OrderSide, TradeEvent, TradingPair};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WebSocketMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::endpoints::{DIFF_EVENT_TYPE, TRADE_EVENT_TYPE};
use crate::order_book::BookEvent;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Default read timeout.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that end a listener run.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Failed to connect to WebSocket.
    #[error("Failed to connect to WebSocket: {0}")]
    ConnectionFailed(String),

    /// Failed to send message.
    #[error("Failed to send message: {0}")]
    SendFailed(String),

    /// Failed to receive message.
    #[error("Failed to receive message: {0}")]
    ReceiveError(String),

    /// Server closed the connection or the stream ended.
    #[error("WebSocket disconnected: {0}")]
    Disconnected(String),

    /// Timed out waiting for message.
    #[error("Timed out waiting for message")]
    Timeout,

    /// Invalid message format.
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

// =============================================================================
// Router
// =============================================================================

/// A decoded stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Public trade
    Trade(TradeEvent),
    /// Depth update
    Diff(OrderBookDiff),
    /// Subscription ack, unknown type or unknown symbol
    Ignored,
}

/// Maps exchange symbols to pairs and decodes text frames.
#[derive(Debug, Clone, Default)]
pub struct StreamRouter {
    symbols: HashMap<String, TradingPair>,
}

impl StreamRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages for `exchange_symbol` to `pair`.
    pub fn add(&mut self, pair: TradingPair, exchange_symbol: &str) {
        self.symbols.insert(exchange_symbol.to_lowercase(), pair);
    }

    /// One `SUBSCRIBE` request per instrument, ids from 1, ordered by symbol.
    pub fn subscribe_messages(&self) -> Vec<String> {
        let mut symbols: Vec<&String> = self.symbols.keys().collect();
        symbols.sort();

        symbols
            .into_iter()
            .enumerate()
            .map(|(i, symbol)| {
                serde_json::json!({
                    "method": "SUBSCRIBE",
                    "params": [format!("{}@trade", symbol), format!("{}@depth", symbol)],
                    "id": i + 1,
                })
                .to_string()
            })
            .collect()
    }

    /// Decode one text frame.
    pub fn route(&self, text: &str) -> Result<Routed, StreamError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| StreamError::InvalidMessage(e.to_string()))?;

        let Some(event_type) = value.get("e").and_then(Value::as_str).map(str::to_owned) else {
            debug!(message = %text, "Control message");
            return Ok(Routed::Ignored);
        };

        match event_type.as_str() {
            TRADE_EVENT_TYPE => {
                let trade: WireTrade = serde_json::from_value(value)
                    .map_err(|e| StreamError::InvalidMessage(format!("Invalid trade event: {}", e)))?;
                let Some(pair) = self.pair_for(&trade.symbol) else {
                    return Ok(Routed::Ignored);
                };
                Ok(Routed::Trade(TradeEvent {
                    pair,
                    trade_id: trade.trade_id,
                    price: trade.price,
                    amount: trade.quantity,
                    // Buyer is maker: the taker sold
                    side: if trade.buyer_is_maker {
                        OrderSide::Sell
                    } else {
                        OrderSide::Buy
                    },
                    timestamp_ms: trade.trade_time,
                }))
            }
            DIFF_EVENT_TYPE => {
                let depth: WireDepth = serde_json::from_value(value)
                    .map_err(|e| StreamError::InvalidMessage(format!("Invalid depth event: {}", e)))?;
                let Some(pair) = self.pair_for(&depth.symbol) else {
                    return Ok(Routed::Ignored);
                };
                Ok(Routed::Diff(OrderBookDiff {
                    pair,
                    sequence_start: depth.first_update_id,
                    sequence_end: depth.final_update_id,
                    timestamp_ms: depth.event_time,
                    bid_updates: depth.bids.into_iter().map(BookLevel::from).collect(),
                    ask_updates: depth.asks.into_iter().map(BookLevel::from).collect(),
                }))
            }
            other => {
                debug!(event_type = %other, "Ignoring unknown event type");
                Ok(Routed::Ignored)
            }
        }
    }

    fn pair_for(&self, symbol: &str) -> Option<TradingPair> {
        let pair = self.symbols.get(&symbol.to_lowercase()).cloned();
        if pair.is_none() {
            debug!(symbol = %symbol, "Message for unsubscribed symbol");
        }
        pair
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Market-data WebSocket listener.
#[derive(Debug)]
pub struct StreamListener {
    url: String,
    read_timeout: Duration,
    router: StreamRouter,
    books: HashMap<TradingPair, mpsc::Sender<BookEvent>>,
    trades: mpsc::Sender<TradeEvent>,
}

impl StreamListener {
    /// Create a listener that publishes trades to `trades`.
    pub fn new(url: impl Into<String>, read_timeout: Duration, trades: mpsc::Sender<TradeEvent>) -> Self {
        Self {
            url: url.into(),
            read_timeout,
            router: StreamRouter::new(),
            books: HashMap::new(),
            trades,
        }
    }

    /// Subscribe an instrument and route its depth updates to `book`.
    pub fn add_instrument(&mut self, pair: TradingPair, exchange_symbol: &str, book: mpsc::Sender<BookEvent>) {
        self.router.add(pair.clone(), exchange_symbol);
        self.books.insert(pair, book);
    }

    pub fn instruments(&self) -> usize {
        self.books.len()
    }

    /// Connect, subscribe and forward messages until an error or cancellation.
    ///
    /// Returns `Ok(())` only when `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), StreamError> {
        info!(url = %self.url, instruments = self.books.len(), "Connecting to market data stream");

        let connect = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            result = connect_async(self.url.as_str()) => result,
        };
        let (mut ws, _) = connect.map_err(|e| StreamError::ConnectionFailed(e.to_string()))?;

        for message in self.router.subscribe_messages() {
            ws.send(WebSocketMessage::Text(message))
                .await
                .map_err(|e| StreamError::SendFailed(e.to_string()))?;
        }
        info!(url = %self.url, "Subscribed to market data stream");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Market data stream cancelled");
                    let _ = ws.close(None).await;
                    return Ok(());
                }
                next = timeout(self.read_timeout, ws.next()) => next,
            };

            let message = match next {
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(e))) => {
                    error!(error = %e, "WebSocket error");
                    return Err(StreamError::ReceiveError(e.to_string()));
                }
                Ok(None) => {
                    warn!("WebSocket stream ended");
                    return Err(StreamError::Disconnected("stream ended".to_string()));
                }
                Err(_) => {
                    error!(timeout_ms = self.read_timeout.as_millis() as u64, "Timeout waiting for message");
                    return Err(StreamError::Timeout);
                }
            };

            if !self.handle_message(&mut ws, message, &cancel).await? {
                return Ok(());
            }
        }
    }

    /// Returns `Ok(false)` when cancelled while forwarding.
    async fn handle_message(
        &self,
        ws: &mut WsStream,
        message: WebSocketMessage,
        cancel: &CancellationToken,
    ) -> Result<bool, StreamError> {
        match message {
            WebSocketMessage::Text(text) => match self.router.route(&text) {
                Ok(Routed::Trade(trade)) => Ok(forward(&self.trades, trade, cancel).await),
                Ok(Routed::Diff(diff)) => match self.books.get(&diff.pair) {
                    Some(book) => Ok(forward(book, BookEvent::Diff(diff), cancel).await),
                    None => Ok(true),
                },
                Ok(Routed::Ignored) => Ok(true),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed message");
                    Ok(true)
                }
            },
            WebSocketMessage::Ping(payload) => {
                debug!("Received ping");
                ws.send(WebSocketMessage::Pong(payload))
                    .await
                    .map_err(|e| StreamError::SendFailed(e.to_string()))?;
                Ok(self.heartbeat(cancel).await)
            }
            WebSocketMessage::Pong(_) => {
                debug!("Received pong");
                Ok(self.heartbeat(cancel).await)
            }
            WebSocketMessage::Close(frame) => {
                warn!(frame = ?frame, "WebSocket connection closed by server");
                Err(StreamError::Disconnected(
                    frame.map(|f| f.reason.to_string()).unwrap_or_else(|| "close frame".to_string()),
                ))
            }
            _ => Ok(true),
        }
    }

    async fn heartbeat(&self, cancel: &CancellationToken) -> bool {
        for book in self.books.values() {
            if !forward(book, BookEvent::Heartbeat, cancel).await {
                return false;
            }
        }
        true
    }
}

/// Send with backpressure. Returns false if cancelled while waiting.
async fn forward<T>(tx: &mpsc::Sender<T>, item: T, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => {
            if sent.is_err() {
                debug!("Receiver dropped, discarding event");
            }
            true
        }
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
struct WireTrade {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "t")]
    trade_id: u64,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "q")]
    quantity: Decimal,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct WireDepth {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b", default)]
    bids: Vec<(Decimal, Decimal)>,
    #[serde(rename = "a", default)]
    asks: Vec<(Decimal, Decimal)>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn router() -> StreamRouter {
        let mut router = StreamRouter::new();
        router.add(TradingPair::new("BTC", "USDT").unwrap(), "btcusdt");
        router
    }

    #[test]
    fn test_subscribe_message_shape() {
        let messages = router().subscribe_messages();

        assert_eq!(messages.len(), 1);
        let value: Value = serde_json::from_str(&messages[0]).unwrap();
        assert_eq!(value["method"], "SUBSCRIBE");
        assert_eq!(value["params"], serde_json::json!(["btcusdt@trade", "btcusdt@depth"]));
        assert_eq!(value["id"], 1);
    }

    #[test]
    fn test_route_trade_event() {
        let text = r#"{"e":"trade","E":123456789,"s":"btcusdt","t":12345,"p":"0.001","q":"100",
                       "b":88,"a":50,"T":123456785,"m":true,"M":true}"#;

        let routed = router().route(text).unwrap();

        let Routed::Trade(trade) = routed else {
            panic!("expected trade, got {:?}", routed);
        };
        assert_eq!(trade.trade_id, 12345);
        assert_eq!(trade.price, dec!(0.001));
        assert_eq!(trade.amount, dec!(100));
        assert_eq!(trade.side, OrderSide::Sell);
        assert_eq!(trade.timestamp_ms, 123456785);
    }

    #[test]
    fn test_route_depth_update() {
        let text = r#"{"e":"depthUpdate","E":123456789,"s":"btcusdt","U":157,"u":160,
                       "b":[["0.0024","10"]],"a":[["0.0026","100"]]}"#;

        let routed = router().route(text).unwrap();

        let Routed::Diff(diff) = routed else {
            panic!("expected diff, got {:?}", routed);
        };
        assert_eq!(diff.sequence_start, 157);
        assert_eq!(diff.sequence_end, 160);
        assert_eq!(diff.bid_updates, vec![BookLevel::new(dec!(0.0024), dec!(10))]);
        assert_eq!(diff.ask_updates, vec![BookLevel::new(dec!(0.0026), dec!(100))]);
    }

    #[test]
    fn test_acks_and_unknown_events_are_ignored() {
        let r = router();

        assert_eq!(r.route(r#"{"result":null,"id":1}"#).unwrap(), Routed::Ignored);
        assert_eq!(r.route(r#"{"e":"kline","s":"btcusdt"}"#).unwrap(), Routed::Ignored);
        assert_eq!(
            r.route(r#"{"e":"trade","E":1,"s":"ethusdt","t":1,"p":"1","q":"1","T":1,"m":false}"#)
                .unwrap(),
            Routed::Ignored
        );
    }

    #[test]
    fn test_malformed_messages_are_errors() {
        let r = router();

        assert!(matches!(r.route("not json"), Err(StreamError::InvalidMessage(_))));
        assert!(matches!(
            r.route(r#"{"e":"depthUpdate","s":"btcusdt"}"#),
            Err(StreamError::InvalidMessage(_))
        ));
    }
}
