//! Daemon: Main runtime orchestrator.
//!
//! The Daemon ties together all components:
//! - Connector session (clock, rate limiter, REST, symbol map)
//! - Stream listener (one connection for every pair)
//! - Order book synchronizers (one per pair)
//! - Clock resync, book reporter and trade logger
//!
//! # Lifecycle
//!
//! 1. Load configuration
//! 2. Start the connector (clock sync, symbol map)
//! 3. Spawn the market data tasks
//! 4. Supervise until shutdown (SIGINT)
//! 5. Cancel every task and wait for them to stop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dexfin_connectors::stream::READ_TIMEOUT;
use dexfin_connectors::{
    BookHandle, ConnectorError, DexfinConnector, OrderBookSynchronizer, StreamListener,
};
use dexfin_domain::TradingPair;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{DaemonError, DaemonResult};
use crate::market_data::{log_trades, report_books, run_stream};

/// Capacity of the trade queue between the listener and the trade logger.
const TRADE_QUEUE_CAPACITY: usize = 1_000;

/// How long tasks get to stop after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type TaskResult = (String, DaemonResult<()>);

// =============================================================================
// Daemon
// =============================================================================

/// The main Dexfin daemon.
#[derive(Debug)]
pub struct Daemon {
    /// Configuration
    config: Config,
    /// Exchange session
    connector: Arc<DexfinConnector>,
}

impl Daemon {
    /// Create a daemon from configuration. Nothing touches the network yet.
    pub fn new(config: Config) -> DaemonResult<Self> {
        let credentials = config.exchange.credentials();
        if credentials.is_none() {
            info!("No API credentials configured, private endpoints disabled");
        }

        let connector =
            DexfinConnector::new(config.connector_config(), config.rate_limits()?, credentials)?;

        Ok(Self {
            config,
            connector: Arc::new(connector),
        })
    }

    /// Exchange session.
    pub fn connector(&self) -> &Arc<DexfinConnector> {
        &self.connector
    }

    /// Run the daemon.
    ///
    /// This method blocks until shutdown is requested (SIGINT).
    pub async fn run(self) -> DaemonResult<()> {
        self.run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
        })
        .await
    }

    /// Run until `shutdown` completes.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> DaemonResult<()> {
        let mut running = self.spawn().await?;
        running.supervise(shutdown).await;
        running.shutdown().await;
        Ok(())
    }

    /// Start the connector and spawn every market data task.
    pub async fn spawn(&self) -> DaemonResult<RunningDaemon> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            environment = %self.config.environment,
            rest_url = %self.config.exchange.rest_url,
            "Starting Dexfin daemon"
        );

        let listed = self.connector.start().await?;
        if self.connector.rest().has_credentials() {
            self.log_balances().await;
        }

        let pairs: Vec<TradingPair> = self
            .config
            .market_data
            .trading_pairs
            .iter()
            .filter(|pair| {
                let available = listed.contains(*pair);
                if !available {
                    warn!(pair = %pair, "Configured pair is not listed, skipping");
                }
                available
            })
            .cloned()
            .collect();
        if pairs.is_empty() {
            return Err(DaemonError::Config(
                "None of the configured trading pairs are listed on the exchange".to_string(),
            ));
        }

        let cancel = CancellationToken::new();
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();

        let (trade_tx, trade_rx) = mpsc::channel(TRADE_QUEUE_CAPACITY);
        let mut listener = StreamListener::new(self.config.exchange.ws_url.clone(), READ_TIMEOUT, trade_tx);
        let source = self.connector.order_book_source();
        let book_config = self.config.book_sync_config();
        let mut books = Vec::with_capacity(pairs.len());

        for pair in pairs {
            let symbol = self.connector.symbols().resolve(&pair)?;
            let (book_tx, book_rx) = mpsc::channel(book_config.buffer_capacity);
            listener.add_instrument(pair.clone(), &symbol, book_tx);

            let synchronizer =
                OrderBookSynchronizer::new(pair.clone(), book_config.clone(), source.clone(), book_rx);
            books.push((pair.clone(), synchronizer.handle()));

            let token = cancel.child_token();
            let task_pair = pair.clone();
            tasks.spawn(async move {
                let result = match synchronizer.run(token).await {
                    Ok(()) | Err(ConnectorError::Cancelled) => Ok(()),
                    Err(e) => Err(DaemonError::from(e)),
                };
                (format!("book {}", task_pair), result)
            });
            info!(pair = %pair, symbol = %symbol, "Tracking pair");
        }

        let token = cancel.child_token();
        tasks.spawn(async move { ("stream".to_string(), run_stream(listener, token).await) });

        let token = cancel.child_token();
        tasks.spawn(async move {
            let result = log_trades(trade_rx, token).await.map(|_| ());
            ("trades".to_string(), result)
        });

        let token = cancel.child_token();
        let handles = books.clone();
        let period = self.config.market_data.report_interval;
        tasks.spawn(async move { ("reporter".to_string(), report_books(handles, period, token).await) });

        let token = cancel.child_token();
        let connector = self.connector.clone();
        let period = self.config.market_data.clock_sync_interval;
        tasks.spawn(async move { ("clock".to_string(), resync_clock(connector, period, token).await) });

        info!(pairs = books.len(), tasks = tasks.len(), "Dexfin daemon running");

        Ok(RunningDaemon {
            cancel,
            tasks,
            books,
        })
    }

    async fn log_balances(&self) {
        match self.connector.balances().await {
            Ok(balances) => {
                for (asset, balance) in balances.iter().filter(|(_, b)| !b.total().is_zero()) {
                    info!(
                        asset = %asset,
                        available = %balance.available,
                        locked = %balance.locked,
                        "Balance"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Failed to load balances"),
        }
    }
}

// =============================================================================
// Running daemon
// =============================================================================

/// Handle to the spawned tasks.
#[derive(Debug)]
pub struct RunningDaemon {
    cancel: CancellationToken,
    tasks: JoinSet<TaskResult>,
    books: Vec<(TradingPair, BookHandle)>,
}

impl RunningDaemon {
    /// Read handles of every synchronized book.
    pub fn books(&self) -> &[(TradingPair, BookHandle)] {
        &self.books
    }

    /// Handle for one pair.
    pub fn book(&self, pair: &TradingPair) -> Option<&BookHandle> {
        self.books.iter().find(|(p, _)| p == pair).map(|(_, h)| h)
    }

    /// Log task exits until `shutdown` completes.
    pub async fn supervise(&mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => return,
                Some(joined) = self.tasks.join_next() => log_task_exit(joined),
            }
        }
    }

    /// Cancel every task and wait for them to stop.
    pub async fn shutdown(mut self) {
        info!("Initiating graceful shutdown");
        self.cancel.cancel();

        let drained = timeout(SHUTDOWN_GRACE, async {
            while let Some(joined) = self.tasks.join_next().await {
                log_task_exit(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(remaining = self.tasks.len(), "Tasks did not stop in time, aborting");
            self.tasks.abort_all();
        }
        info!("Shutdown complete");
    }
}

fn log_task_exit(joined: Result<TaskResult, JoinError>) {
    match joined {
        Ok((name, Ok(()))) => debug!(task = %name, "Task stopped"),
        Ok((name, Err(e))) => error!(task = %name, error = %e, "Task failed"),
        Err(e) => error!(error = %e, "Task panicked or was aborted"),
    }
}

/// Resample the clock offset every `period`.
async fn resync_clock(
    connector: Arc<DexfinConnector>,
    period: Duration,
    cancel: CancellationToken,
) -> DaemonResult<()> {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => match connector.resync_clock().await {
                Ok(offset_ms) => debug!(offset_ms, "Clock resynchronized"),
                Err(e) => warn!(error = %e, "Clock resync failed"),
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_daemon_creation() {
        let daemon = Daemon::new(Config::test()).unwrap();

        assert!(!daemon.connector().rest().has_credentials());
        assert!(!daemon.connector().symbols().is_populated());
    }

    #[test]
    fn test_daemon_with_credentials() {
        let mut config = Config::test();
        config.exchange.api_key = Some("key".to_string());
        config.exchange.api_secret = Some("secret".to_string().into());

        let daemon = Daemon::new(config).unwrap();

        assert!(daemon.connector().rest().has_credentials());
    }

    #[tokio::test]
    async fn test_spawn_fails_when_exchange_unreachable() {
        let daemon = Daemon::new(Config::test()).unwrap();

        let result = daemon.spawn().await;

        assert!(matches!(result, Err(DaemonError::Connector(_))));
    }
}
