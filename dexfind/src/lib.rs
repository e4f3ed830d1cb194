//! Dexfin Daemon Library
//!
//! Runtime orchestrator for the Dexfin exchange connector.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────────────────┐
//!  WebSocket ───────▶│ StreamListener           │──▶ trades ──▶ trade logger
//!                    └───────────┬──────────────┘
//!                                │ diffs / heartbeats (per pair)
//!                                ▼
//!  REST depth ──────▶ OrderBookSynchronizer (per pair) ──▶ BookHandle ──▶ reporter
//!
//!  REST timestamp ──▶ ClockSynchronizer (periodic resync)
//! ```
//!
//! # Components
//!
//! - **Daemon**: Main runtime orchestrator
//! - **Market data**: Stream reconnect loop, book reporter, trade logger
//! - **Config**: Environment-based configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use dexfind::{Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let daemon = Daemon::new(config).expect("Failed to build daemon");
//!     daemon.run().await.expect("Daemon error");
//! }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod daemon;
pub mod error;
pub mod market_data;

// Re-exports for convenience
pub use config::{Config, Environment, ExchangeConfig, MarketDataConfig};
pub use daemon::{Daemon, RunningDaemon};
pub use error::{DaemonError, DaemonResult};
