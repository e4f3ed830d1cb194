//! Dexfin Daemon
//!
//! Keeps synchronized order books for the configured pairs and logs them.
//!
//! # Usage
//!
//! ```bash
//! # Start with default configuration
//! cargo run -p dexfind
//!
//! # Track two pairs with a faster stale timeout
//! DEXFIN_TRADING_PAIRS=BTC-USDT,ETH-USDT DEXFIN_BOOK_STALE_SECS=10 cargo run -p dexfind
//! ```
//!
//! # Environment Variables
//!
//! - `DEXFIN_ENV`: Environment (test, development, production)
//! - `DEXFIN_API_KEY` / `DEXFIN_SECRET_KEY`: API credentials (optional, set together)
//! - `DEXFIN_REST_URL`: REST base URL
//! - `DEXFIN_WS_URL`: Streaming URL
//! - `DEXFIN_TRADING_PAIRS`: Comma-separated pairs (default: BTC-USDT)
//! - `DEXFIN_REQUEST_TIMEOUT_MS`: REST timeout (default: 10000)
//! - `DEXFIN_BOOK_STALE_SECS`: Book stale timeout (default: 30)
//! - `DEXFIN_CLOCK_SYNC_SECS`: Clock resync period (default: 300)
//! - `DEXFIN_BOOK_REPORT_SECS`: Top-of-book log period (default: 10)
//! - `DEXFIN_RATE_LIMIT_OVERRIDES`: `NAME=capacity` list, e.g. `ORDERS=5,DEPTH=20`

use dexfind::{Config, Daemon};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("dexfind=info".parse()?)
                .add_directive("dexfin_connectors=info".parse()?),
        )
        .init();

    // Load configuration
    let config = Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        pairs = config.market_data.trading_pairs.len(),
        authenticated = config.exchange.credentials().is_some(),
        "Dexfin Daemon"
    );

    // Create and run daemon
    let daemon = Daemon::new(config)?;
    daemon.run().await?;

    Ok(())
}
