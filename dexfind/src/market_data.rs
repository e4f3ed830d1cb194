//! Market data tasks.
//!
//! Keeps the stream listener connected and reports what flows out of it:
//! top of book per pair on a timer, and public trades as they arrive.

use std::collections::HashSet;
use std::time::Duration;

use dexfin_connectors::{BookHandle, BookView, StreamListener};
use dexfin_domain::{TradeEvent, TradingPair};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DaemonResult;

/// First reconnect delay.
pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Reconnect delay ceiling.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
/// A connection that lived this long resets the reconnect delay.
const STABLE_CONNECTION: Duration = Duration::from_secs(60);

/// Run the listener, reconnecting with exponential backoff until cancelled.
pub async fn run_stream(listener: StreamListener, cancel: CancellationToken) -> DaemonResult<()> {
    let mut delay = RECONNECT_INITIAL_DELAY;

    loop {
        let connected_at = Instant::now();
        match listener.run(cancel.clone()).await {
            Ok(()) => {
                info!("Market data stream stopped");
                return Ok(());
            }
            Err(e) => {
                if connected_at.elapsed() >= STABLE_CONNECTION {
                    delay = RECONNECT_INITIAL_DELAY;
                }
                warn!(
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Market data stream lost, reconnecting"
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = sleep(delay) => {}
        }
        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
    }
}

/// Log top of book for every pair each `period`.
pub async fn report_books(
    books: Vec<(TradingPair, BookHandle)>,
    period: Duration,
    cancel: CancellationToken,
) -> DaemonResult<()> {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately, before any book could sync
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                for (pair, handle) in &books {
                    log_book(pair, &handle.current_book());
                }
            }
        }
    }
}

fn log_book(pair: &TradingPair, view: &BookView) {
    match view.fresh() {
        Some(book) => info!(
            pair = %pair,
            best_bid = ?book.best_bid(),
            best_ask = ?book.best_ask(),
            spread = ?book.spread(),
            sequence = book.sequence_id,
            "Top of book"
        ),
        None => warn!(
            pair = %pair,
            state = %view.state,
            failures = view.consecutive_failures,
            "Book not synced"
        ),
    }
}

/// Drain the trade queue. Returns when cancelled or when the listener is gone.
///
/// Returns the number of trades seen.
pub async fn log_trades(
    mut trades: mpsc::Receiver<TradeEvent>,
    cancel: CancellationToken,
) -> DaemonResult<u64> {
    let mut first_seen: HashSet<TradingPair> = HashSet::new();
    let mut count = 0u64;

    loop {
        let trade = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            trade = trades.recv() => trade,
        };
        let Some(trade) = trade else {
            break;
        };
        count += 1;

        if first_seen.insert(trade.pair.clone()) {
            info!(
                pair = %trade.pair,
                price = %trade.price,
                amount = %trade.amount,
                side = %trade.side,
                "First trade received"
            );
        } else {
            debug!(
                pair = %trade.pair,
                trade_id = trade.trade_id,
                price = %trade.price,
                amount = %trade.amount,
                "Trade"
            );
        }
    }

    info!(trades = count, "Trade logger stopped");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dexfin_domain::OrderSide;
    use rust_decimal_macros::dec;

    fn trade(id: u64) -> TradeEvent {
        TradeEvent {
            pair: TradingPair::new("BTC", "USDT").unwrap(),
            trade_id: id,
            price: dec!(30000),
            amount: dec!(0.1),
            side: OrderSide::Buy,
            timestamp_ms: 1_704_448_800_000,
        }
    }

    #[tokio::test]
    async fn test_trade_logger_drains_until_sender_dropped() {
        let (tx, rx) = mpsc::channel(8);
        for id in 1..=3 {
            tx.send(trade(id)).await.unwrap();
        }
        drop(tx);

        let count = log_trades(rx, CancellationToken::new()).await.unwrap();

        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_trade_logger_stops_on_cancel() {
        let (_tx, rx) = mpsc::channel::<TradeEvent>(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let count = log_trades(rx, cancel).await.unwrap();

        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_stream_supervisor_stops_on_cancel_while_backing_off() {
        // Nothing listens here, so every attempt fails to connect
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let (trades, _rx) = mpsc::channel(1);
        let listener = StreamListener::new(format!("ws://{}", addr), Duration::from_secs(1), trades);
        let cancel = CancellationToken::new();

        let supervisor = tokio::spawn(run_stream(listener, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), supervisor)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_book_reporter_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let reporter = tokio::spawn(report_books(Vec::new(), Duration::from_secs(1), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();

        assert!(reporter.await.unwrap().is_ok());
    }
}
